use std::{collections::BTreeMap, path::Path};

use anyhow::{bail, Result};
use ndarray::{Array1, ArrayD};

/// Name of the generator used by a chain.
pub const RNG_NAME: &str = ".RNG.name";
/// Seed of the generator used by a chain.
pub const RNG_SEED: &str = ".RNG.seed";
/// Opaque state of the generator used by a chain.
pub const RNG_STATE: &str = ".RNG.state";

/// Dense arrays as the engine sees them. Missing entries hold the
/// runtime's sentinel value.
pub type DataMap = BTreeMap<String, ArrayD<f64>>;

/// Which nodes of a chain `Engine::dump_state` should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    /// Observed nodes, with the sentinel at unobserved positions.
    Data,
    /// Unobserved nodes, with the sentinel at observed positions.
    Parameters,
    All,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDump {
    pub values: DataMap,
    pub rng_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RngInit {
    /// Engines take integer seeds. A `u32` is represented exactly by the
    /// `f64` the engine receives.
    Seed(u32),
    State(Vec<i64>),
}

/// The random number generator a chain should use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RngAssignment {
    pub name: Option<String>,
    pub init: Option<RngInit>,
}

impl RngAssignment {
    pub fn seeded(name: impl Into<String>, seed: u32) -> Self {
        Self {
            name: Some(name.into()),
            init: Some(RngInit::Seed(seed)),
        }
    }

    /// Add the seed or state to the initial values of a chain.
    pub(crate) fn write_values(&self, values: &mut DataMap) {
        match &self.init {
            Some(RngInit::Seed(seed)) => {
                values.insert(RNG_SEED.to_string(), ArrayD::from_elem(vec![1], f64::from(*seed)));
            }
            Some(RngInit::State(state)) => {
                let state: Vec<f64> = state.iter().map(|&x| x as f64).collect();
                values.insert(RNG_STATE.to_string(), Array1::from(state).into_dyn());
            }
            None => {}
        }
    }
}

/// One session of the sampling engine, owning one or more chains.
///
/// Sessions are not reentrant. A session is only ever used by one thread
/// at a time, but it may move between threads, so it has to be `Send`.
pub trait Engine: Send {
    /// Parse the model at `path`.
    fn check_model(&mut self, path: &Path) -> Result<()>;

    /// Compile the model with observed data into `chains` chains.
    fn compile(&mut self, data: &DataMap, chains: usize, generate_data: bool) -> Result<()>;

    fn set_rng_name(&mut self, name: &str, chain: usize) -> Result<()>;

    /// Set initial values (including `.RNG.seed` and `.RNG.state`) of a chain.
    fn set_parameters(&mut self, values: &DataMap, chain: usize) -> Result<()>;

    fn initialize(&mut self) -> Result<()>;

    fn is_adapting(&self) -> bool;

    /// Advance all chains of this session by `iterations`.
    fn update(&mut self, iterations: u64) -> Result<()>;

    /// Returns true if the samplers reached their adaptation target.
    fn check_adaptation(&mut self) -> Result<bool>;

    fn adapt_off(&mut self) -> Result<()>;

    fn set_monitor(&mut self, name: &str, thin: u64, kind: &str) -> Result<()>;

    fn clear_monitor(&mut self, name: &str, kind: &str) -> Result<()>;

    /// Recorded values of all monitors of `kind`, each with shape
    /// `(dims..., iterations, chains)`.
    fn dump_monitors(&mut self, kind: &str, flat: bool) -> Result<DataMap>;

    fn dump_state(&mut self, kind: DumpKind, chain: usize) -> Result<StateDump>;

    fn variable_names(&self) -> Vec<String>;

    fn nchain(&self) -> usize;

    /// Number of iterations run so far.
    fn iteration(&self) -> u64;
}

/// Process wide part of the sampling engine.
pub trait Runtime: Send + Sync + 'static {
    type Engine: Engine;

    fn new_engine(&self) -> Result<Self::Engine>;

    /// The reserved value that marks missing entries at the engine boundary.
    fn missing_value(&self) -> f64;

    fn load_module(&self, name: &str) -> Result<()>;

    fn unload_module(&self, name: &str) -> Result<()>;

    fn list_modules(&self) -> Vec<String>;

    /// Generators with non-overlapping streams, one per requested stream.
    fn parallel_rngs(&self, factory: &str, streams: usize) -> Result<Vec<RngAssignment>> {
        let _ = streams;
        bail!("Runtime has no parallel random number generator {}", factory)
    }
}
