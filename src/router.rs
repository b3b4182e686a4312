//! Spreads the chains of a model over several engine instances and presents
//! them as if a single engine owned all of them.

use std::{
    ops::{Deref, DerefMut},
    path::Path,
};

use anyhow::{anyhow, Context};
use itertools::Itertools;
use ndarray::{concatenate, ArrayD, Axis};
use tracing::{debug, warn};

use crate::{
    engine::{DataMap, DumpKind, Engine, StateDump},
    executor::Worker,
    Error, Result,
};

/// Where a logical chain lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Index of the engine instance.
    pub instance: usize,
    /// 1-based chain id inside the instance.
    pub local: usize,
}

/// An engine instance together with the contiguous chains it owns.
pub struct Shard<E> {
    engine: E,
    index: usize,
    first_chain: usize,
    chains: usize,
}

impl<E: Engine> Shard<E> {
    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Logical ids of the chains owned by this instance.
    pub fn chains(&self) -> std::ops::RangeInclusive<usize> {
        self.first_chain..=(self.first_chain + self.chains - 1)
    }

    pub fn num_chains(&self) -> usize {
        self.chains
    }
}

impl<E: Engine> Worker for Shard<E> {
    fn weight(&self) -> u64 {
        self.chains as u64
    }

    fn run_batch(&mut self, iterations: u64) -> anyhow::Result<()> {
        self.engine
            .update(iterations)
            .with_context(|| format!("Update of {} iterations failed", iterations))
    }
}

pub struct ChainRouter<E> {
    shards: Vec<Shard<E>>,
    routes: Vec<Route>,
}

impl<E: Engine> ChainRouter<E> {
    /// Create `ceil(total_chains / chains_per_instance)` engine instances.
    /// Every instance owns `chains_per_instance` chains except possibly the
    /// last one.
    pub fn build<F>(total_chains: usize, chains_per_instance: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut() -> anyhow::Result<E>,
    {
        if total_chains == 0 {
            return Err(Error::Configuration(
                "The number of chains must be positive".to_string(),
            ));
        }
        if chains_per_instance == 0 {
            return Err(Error::Configuration(
                "The number of chains per engine instance must be positive".to_string(),
            ));
        }

        let num_instances = total_chains.div_ceil(chains_per_instance);
        let mut shards = Vec::with_capacity(num_instances);
        let mut routes = Vec::with_capacity(total_chains);
        for index in 0..num_instances {
            let first_chain = index * chains_per_instance + 1;
            let chains = chains_per_instance.min(total_chains - index * chains_per_instance);
            let engine =
                factory().with_context(|| format!("Could not create engine instance {}", index))?;
            routes.extend((1..=chains).map(|local| Route {
                instance: index,
                local,
            }));
            shards.push(Shard {
                engine,
                index,
                first_chain,
                chains,
            });
        }
        debug!(
            chains = total_chains,
            instances = num_instances,
            "built chain routing table"
        );
        Ok(Self { shards, routes })
    }

    pub fn num_chains(&self) -> usize {
        self.routes.len()
    }

    pub fn num_instances(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_sizes(&self) -> Vec<usize> {
        self.shards.iter().map(|shard| shard.chains).collect()
    }

    pub fn shards(&self) -> &[Shard<E>] {
        &self.shards
    }

    pub fn shards_mut(&mut self) -> &mut [Shard<E>] {
        &mut self.shards
    }

    pub fn route(&self, chain: usize) -> Result<Route> {
        chain
            .checked_sub(1)
            .and_then(|index| self.routes.get(index))
            .copied()
            .ok_or(Error::ChainOutOfRange {
                chain,
                num_chains: self.routes.len(),
            })
    }

    fn broadcast<F>(&mut self, operation: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&mut E, usize) -> anyhow::Result<()>,
    {
        for shard in self.shards.iter_mut() {
            f(&mut shard.engine, shard.chains).with_context(|| {
                format!("{} failed on engine instance {}", operation, shard.index)
            })?;
        }
        Ok(())
    }

    fn targeted<T, F>(&mut self, chain: usize, f: F) -> Result<T>
    where
        F: FnOnce(&mut E, usize) -> anyhow::Result<T>,
    {
        let route = self.route(chain)?;
        let shard = &mut self.shards[route.instance];
        Ok(f(&mut shard.engine, route.local)
            .with_context(|| format!("Engine instance {} failed for chain {}", route.instance, chain))?)
    }

    pub fn check_model(&mut self, path: &Path) -> Result<()> {
        self.broadcast("Checking the model", |engine, _| engine.check_model(path))
    }

    /// Compile every instance with its own number of chains.
    pub fn compile(&mut self, data: &DataMap, generate_data: bool) -> Result<()> {
        self.broadcast("Compiling the model", |engine, chains| {
            engine.compile(data, chains, generate_data)
        })
    }

    pub fn initialize(&mut self) -> Result<()> {
        self.broadcast("Initializing the model", |engine, _| engine.initialize())
    }

    pub fn adapt_off(&mut self) -> Result<()> {
        self.broadcast("Turning off adaptation", |engine, _| engine.adapt_off())
    }

    pub fn set_rng_name(&mut self, name: &str, chain: usize) -> Result<()> {
        self.targeted(chain, |engine, local| engine.set_rng_name(name, local))
    }

    pub fn set_parameters(&mut self, values: &DataMap, chain: usize) -> Result<()> {
        self.targeted(chain, |engine, local| engine.set_parameters(values, local))
    }

    pub fn dump_state(&mut self, kind: DumpKind, chain: usize) -> Result<StateDump> {
        self.targeted(chain, |engine, local| engine.dump_state(kind, local))
    }

    pub fn is_adapting(&self) -> bool {
        self.shards.iter().any(|shard| shard.engine.is_adapting())
    }

    /// True only if every instance finished adapting successfully.
    pub fn check_adaptation(&mut self) -> Result<bool> {
        let mut ok = true;
        for shard in self.shards.iter_mut() {
            ok &= shard
                .engine
                .check_adaptation()
                .with_context(|| format!("Adaptation check failed on instance {}", shard.index))?;
        }
        Ok(ok)
    }

    /// Set a monitor on every instance. If any instance fails, the monitor is
    /// removed again from the instances where it was already set.
    pub fn set_monitor(&mut self, name: &str, thin: u64, kind: &str) -> Result<()> {
        for position in 0..self.shards.len() {
            let result = self.shards[position].engine.set_monitor(name, thin, kind);
            if let Err(err) = result {
                for shard in self.shards[..position].iter_mut() {
                    if let Err(clear_err) = shard.engine.clear_monitor(name, kind) {
                        warn!(
                            monitor = name,
                            instance = shard.index,
                            "could not roll back monitor: {:#}",
                            clear_err
                        );
                    }
                }
                return Err(err
                    .context(format!(
                        "Setting monitor for {} failed on engine instance {}",
                        name, position
                    ))
                    .into());
            }
        }
        Ok(())
    }

    pub fn clear_monitor(&mut self, name: &str, kind: &str) -> Result<()> {
        self.broadcast("Clearing a monitor", |engine, _| {
            engine.clear_monitor(name, kind)
        })
    }

    /// Instances in routing table order. Fails if the chains of an instance
    /// are not a contiguous block numbered from one.
    fn instance_order(&self) -> Result<Vec<usize>> {
        let order = self.routes.iter().map(|route| route.instance).dedup().collect_vec();
        if !order.iter().all_unique() {
            return Err(Error::Routing(
                "Chains of an engine instance are not contiguous".to_string(),
            ));
        }
        for (instance, group) in &self.routes.iter().chunk_by(|route| route.instance) {
            let locals = group.map(|route| route.local).collect_vec();
            let expected = (1..=self.shards[instance].chains).collect_vec();
            if locals != expected {
                return Err(Error::Routing(format!(
                    "Engine instance {} owns local chains {:?}, expected {:?}",
                    instance, locals, expected
                )));
            }
        }
        Ok(order)
    }

    /// Recorded samples of all instances, concatenated along the chain axis
    /// in routing table order.
    pub fn dump_monitors(&mut self, kind: &str) -> Result<DataMap> {
        let order = self.instance_order()?;
        let mut dumps = Vec::with_capacity(order.len());
        for &instance in order.iter() {
            let shard = &mut self.shards[instance];
            let dump = shard
                .engine
                .dump_monitors(kind, false)
                .with_context(|| format!("Could not read monitors of instance {}", instance))?;
            for (name, values) in dump.iter() {
                let chains = values.shape().last().copied().unwrap_or(0);
                if chains != shard.chains {
                    return Err(Error::Routing(format!(
                        "Instance {} returned {} chains for {}, but owns {}",
                        instance, chains, name, shard.chains
                    )));
                }
            }
            dumps.push(dump);
        }

        let Some((first, rest)) = dumps.split_first() else {
            return Ok(DataMap::new());
        };
        if rest
            .iter()
            .any(|dump| !dump.keys().eq(first.keys()))
        {
            return Err(Error::Routing(
                "Engine instances recorded different monitors".to_string(),
            ));
        }

        first
            .iter()
            .map(|(name, values)| {
                let axis = Axis(values.ndim() - 1);
                let views = dumps.iter().map(|dump| dump[name].view()).collect_vec();
                let merged: ArrayD<f64> = concatenate(axis, &views)
                    .map_err(|err| anyhow!("Could not merge samples of {}: {}", name, err))?;
                Ok((name.clone(), merged))
            })
            .collect()
    }

    /// Variables of the model. Every instance loaded the same model, so they
    /// all have to agree.
    pub fn variable_names(&self) -> Result<Vec<String>> {
        let names = self
            .shards
            .iter()
            .map(|shard| shard.engine.variable_names())
            .collect_vec();
        if !names.iter().all_equal() {
            return Err(Error::Routing(
                "Engine instances disagree about the model variables".to_string(),
            ));
        }
        Ok(names.into_iter().next().unwrap_or_default())
    }

    /// Iterations run so far, as reported by the first instance.
    pub fn iteration(&self) -> u64 {
        self.shards
            .first()
            .map(|shard| shard.engine.iteration())
            .unwrap_or(0)
    }
}

/// Monitors that stay set for as long as the guard lives.
///
/// The guard gives access to the router it borrowed. Monitors are cleared
/// by `release`, or on drop if the guard is abandoned because of an error.
pub struct MonitorGuard<'a, E: Engine> {
    router: &'a mut ChainRouter<E>,
    names: Vec<String>,
    kind: String,
}

impl<'a, E: Engine> MonitorGuard<'a, E> {
    pub fn acquire(
        router: &'a mut ChainRouter<E>,
        names: &[String],
        thin: u64,
        kind: &str,
    ) -> Result<Self> {
        let mut guard = Self {
            router,
            names: Vec::with_capacity(names.len()),
            kind: kind.to_string(),
        };
        for name in names {
            guard.router.set_monitor(name, thin, kind)?;
            guard.names.push(name.clone());
        }
        Ok(guard)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Clear all monitors, returning the first failure.
    pub fn release(mut self) -> Result<()> {
        let names = std::mem::take(&mut self.names);
        let mut result = Ok(());
        for name in names {
            if let Err(err) = self.router.clear_monitor(&name, &self.kind) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }
}

impl<E: Engine> Deref for MonitorGuard<'_, E> {
    type Target = ChainRouter<E>;

    fn deref(&self) -> &ChainRouter<E> {
        self.router
    }
}

impl<E: Engine> DerefMut for MonitorGuard<'_, E> {
    fn deref_mut(&mut self) -> &mut ChainRouter<E> {
        self.router
    }
}

impl<E: Engine> Drop for MonitorGuard<'_, E> {
    fn drop(&mut self) {
        for name in std::mem::take(&mut self.names) {
            if let Err(err) = self.router.clear_monitor(&name, &self.kind) {
                warn!(monitor = %name, "could not clear monitor: {:#}", err);
            }
        }
    }
}
