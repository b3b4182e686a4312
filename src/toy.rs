//! An in-process engine for models made of independent random variables.
//!
//! Models look like
//!
//! ```text
//! model {
//!     p ~ dunif(0, 1)
//!     x[3] ~ dbern(0.5)
//!     y[] ~ dnorm(0, 0.01)  # size taken from data
//! }
//! ```
//!
//! Every unobserved position is redrawn from its prior in each iteration,
//! using one ChaCha generator per chain. That makes results reproducible
//! from a seed, independent of how chains are grouped into engines, which
//! is what the tests and benchmarks of this crate rely on.

use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::{anyhow, bail, ensure, Context, Result};
use itertools::Itertools;
use ndarray::{ArrayD, IxDyn, Zip};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Bernoulli, Distribution, Normal, Uniform};
use tracing::debug;

use crate::engine::{
    DataMap, DumpKind, Engine, RngAssignment, RngInit, Runtime, StateDump, RNG_SEED, RNG_STATE,
};

/// Marks missing entries at the engine boundary.
pub const MISSING: f64 = -f64::MAX * (1. - 1e-15);

/// Generator that hands out non-overlapping streams.
pub const PARALLEL_RNG: &str = "lecuyer::RngStream";

pub const RNG_NAMES: [&str; 5] = [
    "base::Wichmann-Hill",
    "base::Marsaglia-Multicarry",
    "base::Super-Duper",
    "base::Mersenne-Twister",
    PARALLEL_RNG,
];

/// Chains without an explicit generator cycle through the base generators.
const BASE_RNGS: usize = 4;

const MODULES: [&str; 3] = ["basemod", "bugs", "lecuyer"];

fn is_missing(value: f64) -> bool {
    value.to_bits() == MISSING.to_bits()
}

#[derive(Debug, Clone)]
enum Prior {
    Bernoulli(Bernoulli),
    Normal(Normal<f64>),
    Uniform(Uniform<f64>),
}

impl Prior {
    fn parse(name: &str, args: &[f64]) -> Result<Self> {
        match (name, args) {
            ("dbern", [p]) => Bernoulli::new(*p)
                .map(Prior::Bernoulli)
                .map_err(|err| anyhow!("Invalid dbern({}): {}", p, err)),
            ("dnorm", [mu, tau]) => {
                ensure!(*tau > 0., "Precision of dnorm must be positive, got {}", tau);
                Normal::new(*mu, tau.sqrt().recip())
                    .map(Prior::Normal)
                    .map_err(|err| anyhow!("Invalid dnorm({}, {}): {}", mu, tau, err))
            }
            ("dunif", [lower, upper]) => Uniform::new(*lower, *upper)
                .map(Prior::Uniform)
                .map_err(|err| anyhow!("Invalid dunif({}, {}): {}", lower, upper, err)),
            _ => bail!(
                "Unknown distribution {} with {} arguments",
                name,
                args.len()
            ),
        }
    }

    fn is_continuous(&self) -> bool {
        !matches!(self, Prior::Bernoulli(_))
    }

    fn supports(&self, value: f64) -> bool {
        match self {
            Prior::Bernoulli(_) => value == 0. || value == 1.,
            _ => value.is_finite(),
        }
    }

    fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            Prior::Bernoulli(dist) => {
                if dist.sample(rng) {
                    1.
                } else {
                    0.
                }
            }
            Prior::Normal(dist) => dist.sample(rng),
            Prior::Uniform(dist) => dist.sample(rng),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Size {
    Scalar,
    Fixed(Vec<usize>),
    FromData,
}

#[derive(Debug, Clone)]
struct Declaration {
    name: String,
    size: Size,
    prior: Prior,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn parse_declaration(statement: &str) -> Result<Declaration> {
    let (lhs, rhs) = statement
        .split_once('~')
        .context("Expected `name ~ distribution(...)`")?;
    let lhs = lhs.trim();
    let (name, size) = match lhs.split_once('[') {
        Some((name, dims)) => {
            let dims = dims.trim_end().strip_suffix(']').context("Unclosed index")?.trim();
            if dims.is_empty() {
                (name.trim(), Size::FromData)
            } else {
                let dims = dims
                    .split(',')
                    .map(|dim| {
                        dim.trim()
                            .parse::<usize>()
                            .ok()
                            .filter(|&dim| dim > 0)
                            .with_context(|| format!("Invalid dimension {:?}", dim.trim()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                (name.trim(), Size::Fixed(dims))
            }
        }
        None => (lhs, Size::Scalar),
    };
    ensure!(is_identifier(name), "Invalid variable name {:?}", name);

    let (dist, args) = rhs
        .trim()
        .split_once('(')
        .context("Expected a distribution")?;
    let args = args.trim_end().strip_suffix(')').context("Unclosed argument list")?;
    let args = args
        .split(',')
        .map(|arg| {
            arg.trim()
                .parse::<f64>()
                .with_context(|| format!("Invalid argument {:?}", arg.trim()))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Declaration {
        name: name.to_string(),
        size,
        prior: Prior::parse(dist.trim(), &args)?,
    })
}

fn parse_model(source: &str) -> Result<Vec<Declaration>> {
    let body = source
        .trim()
        .strip_prefix("model")
        .context("Expected the model to start with `model`")?
        .trim()
        .strip_prefix('{')
        .and_then(|body| body.strip_suffix('}'))
        .context("Expected the model body in braces")?;

    let mut declarations: Vec<Declaration> = vec![];
    for (number, line) in body.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default();
        for statement in line.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let declaration = parse_declaration(statement)
                .with_context(|| format!("Syntax error on line {}: {}", number + 1, statement))?;
            ensure!(
                declarations.iter().all(|other| other.name != declaration.name),
                "Variable {} is declared twice",
                declaration.name
            );
            declarations.push(declaration);
        }
    }
    Ok(declarations)
}

#[derive(Debug)]
struct Node {
    name: String,
    shape: Vec<usize>,
    prior: Prior,
    /// Observed values, `MISSING` where unobserved.
    data: ArrayD<f64>,
    observed: ArrayD<bool>,
}

impl Node {
    fn compile(declaration: &Declaration, data: Option<&ArrayD<f64>>) -> Result<Self> {
        let name = &declaration.name;
        let shape = match (&declaration.size, data) {
            (Size::Scalar, _) => vec![1],
            (Size::Fixed(dims), _) => dims.clone(),
            (Size::FromData, Some(values)) => values.shape().to_vec(),
            (Size::FromData, None) => bail!("Cannot determine the size of {} without data", name),
        };
        let (data, observed) = match data {
            Some(values) => {
                ensure!(
                    values.shape() == shape.as_slice(),
                    "Data for {} has shape {:?}, expected {:?}",
                    name,
                    values.shape(),
                    shape
                );
                let observed = values.mapv(|value| !is_missing(value));
                if let Some(value) = values
                    .iter()
                    .find(|&&value| !is_missing(value) && !declaration.prior.supports(value))
                {
                    bail!("Invalid value {} in data for {}", value, name);
                }
                (values.clone(), observed)
            }
            None => (
                ArrayD::from_elem(IxDyn(&shape), MISSING),
                ArrayD::from_elem(IxDyn(&shape), false),
            ),
        };
        Ok(Self {
            name: name.clone(),
            shape,
            prior: declaration.prior.clone(),
            data,
            observed,
        })
    }

    fn size(&self) -> usize {
        self.shape.iter().product()
    }

    fn is_observed(&self) -> bool {
        self.observed.iter().any(|&observed| observed)
    }

    fn is_free(&self) -> bool {
        self.observed.iter().any(|&observed| !observed)
    }

    fn initial_values<R: Rng + ?Sized>(&self, init: Option<&ArrayD<f64>>, rng: &mut R) -> ArrayD<f64> {
        let mut values = self.data.clone();
        let mut free = self.observed.mapv(|observed| !observed);
        if let Some(init) = init {
            Zip::from(&mut values)
                .and(&mut free)
                .and(init)
                .for_each(|value, free, &start| {
                    if *free && !is_missing(start) {
                        *value = start;
                        *free = false;
                    }
                });
        }
        Zip::from(&mut values).and(&free).for_each(|value, &free| {
            if free {
                *value = self.prior.draw(rng);
            }
        });
        values
    }
}

#[derive(Debug)]
struct Chain {
    rng_name: String,
    rng_init: Option<RngInit>,
    init: DataMap,
    rng: Option<ChaCha8Rng>,
    values: DataMap,
}

impl Chain {
    fn new(rng_name: &str) -> Self {
        Self {
            rng_name: rng_name.to_string(),
            rng_init: None,
            init: DataMap::new(),
            rng: None,
            values: DataMap::new(),
        }
    }

    fn make_rng(&self) -> Result<ChaCha8Rng> {
        let stream = RNG_NAMES
            .iter()
            .position(|&name| name == self.rng_name)
            .unwrap_or(0) as u64;
        Ok(match &self.rng_init {
            Some(RngInit::Seed(seed)) => {
                let mut rng = ChaCha8Rng::seed_from_u64(u64::from(*seed));
                rng.set_stream(stream);
                rng
            }
            Some(RngInit::State(state)) => {
                let &[seed, stream] = state.as_slice() else {
                    bail!("{} must have two entries, got {}", RNG_STATE, state.len());
                };
                let mut rng = ChaCha8Rng::seed_from_u64(seed as u64);
                rng.set_stream(stream as u64);
                rng
            }
            None => ChaCha8Rng::from_rng(&mut rand::rng()),
        })
    }
}

#[derive(Debug)]
struct Monitor {
    thin: u64,
    /// Flattened recorded values per chain.
    samples: Vec<Vec<f64>>,
}

fn chain_index(chain: usize, num_chains: usize) -> Result<usize> {
    chain
        .checked_sub(1)
        .filter(|&index| index < num_chains)
        .with_context(|| format!("Chain {} does not exist, model has {} chains", chain, num_chains))
}

#[derive(Debug, Default)]
pub struct ToyEngine {
    declarations: Option<Vec<Declaration>>,
    nodes: Vec<Node>,
    chains: Vec<Chain>,
    monitors: BTreeMap<String, Monitor>,
    iteration: u64,
    initialized: bool,
    adapting: bool,
}

impl ToyEngine {
    fn node(&self, name: &str) -> Result<&Node> {
        self.nodes
            .iter()
            .find(|node| node.name == name)
            .with_context(|| format!("Unknown variable {}", name))
    }
}

impl Engine for ToyEngine {
    fn check_model(&mut self, path: &Path) -> Result<()> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("Could not read model file {}", path.display()))?;
        let declarations = parse_model(&source)?;
        debug!(variables = declarations.len(), "parsed toy model");
        *self = Self {
            declarations: Some(declarations),
            ..Self::default()
        };
        Ok(())
    }

    fn compile(&mut self, data: &DataMap, chains: usize, _generate_data: bool) -> Result<()> {
        let declarations = self.declarations.as_ref().context("No model loaded")?;
        ensure!(chains > 0, "Number of chains must be positive");
        if let Some(name) = data
            .keys()
            .find(|&name| declarations.iter().all(|decl| &decl.name != name))
        {
            bail!("Unknown variable {} in data", name);
        }

        self.nodes = declarations
            .iter()
            .map(|decl| Node::compile(decl, data.get(&decl.name)))
            .collect::<Result<_>>()?;
        self.chains = (0..chains)
            .map(|index| Chain::new(RNG_NAMES[index % BASE_RNGS]))
            .collect();
        self.monitors.clear();
        self.iteration = 0;
        self.initialized = false;
        self.adapting = false;
        Ok(())
    }

    fn set_rng_name(&mut self, name: &str, chain: usize) -> Result<()> {
        ensure!(
            RNG_NAMES.contains(&name),
            "Unknown random number generator {}",
            name
        );
        ensure!(!self.initialized, "Model is already initialized");
        let index = chain_index(chain, self.chains.len())?;
        self.chains[index].rng_name = name.to_string();
        Ok(())
    }

    fn set_parameters(&mut self, values: &DataMap, chain: usize) -> Result<()> {
        ensure!(!self.initialized, "Model is already initialized");
        let index = chain_index(chain, self.chains.len())?;
        for (name, array) in values {
            match name.as_str() {
                RNG_SEED => {
                    let seed = array.iter().next().with_context(|| format!("{} is empty", RNG_SEED))?;
                    self.chains[index].rng_init = Some(RngInit::Seed(*seed as u32));
                }
                RNG_STATE => {
                    let state = array.iter().map(|&value| value as i64).collect();
                    self.chains[index].rng_init = Some(RngInit::State(state));
                }
                _ => {
                    let node = self.node(name)?;
                    ensure!(
                        array.shape() == node.shape.as_slice(),
                        "Initial value for {} has shape {:?}, expected {:?}",
                        name,
                        array.shape(),
                        node.shape
                    );
                    let overlaps = Zip::from(array)
                        .and(&node.observed)
                        .fold(false, |found, &value, &observed| {
                            found || (observed && !is_missing(value))
                        });
                    ensure!(
                        !overlaps,
                        "Cannot set initial value of observed node {}",
                        name
                    );
                    self.chains[index].init.insert(name.clone(), array.clone());
                }
            }
        }
        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        ensure!(!self.chains.is_empty(), "Model is not compiled");
        for chain in self.chains.iter_mut() {
            let mut rng = chain.make_rng()?;
            chain.values = self
                .nodes
                .iter()
                .map(|node| {
                    let values = node.initial_values(chain.init.get(&node.name), &mut rng);
                    (node.name.clone(), values)
                })
                .collect();
            chain.rng = Some(rng);
        }
        self.adapting = self
            .nodes
            .iter()
            .any(|node| node.prior.is_continuous() && node.is_free());
        self.initialized = true;
        Ok(())
    }

    fn is_adapting(&self) -> bool {
        self.adapting
    }

    fn update(&mut self, iterations: u64) -> Result<()> {
        ensure!(self.initialized, "Model is not initialized");
        for _ in 0..iterations {
            self.iteration += 1;
            for (index, chain) in self.chains.iter_mut().enumerate() {
                let rng = chain.rng.as_mut().context("Chain has no generator")?;
                for node in self.nodes.iter() {
                    let values = chain
                        .values
                        .get_mut(&node.name)
                        .with_context(|| format!("Chain has no value for {}", node.name))?;
                    Zip::from(values).and(&node.observed).for_each(|value, &observed| {
                        if !observed {
                            *value = node.prior.draw(rng);
                        }
                    });
                }
                for (name, monitor) in self.monitors.iter_mut() {
                    if self.iteration % monitor.thin == 0 {
                        monitor.samples[index].extend(chain.values[name].iter().copied());
                    }
                }
            }
        }
        Ok(())
    }

    fn check_adaptation(&mut self) -> Result<bool> {
        ensure!(self.initialized, "Model is not initialized");
        Ok(true)
    }

    fn adapt_off(&mut self) -> Result<()> {
        self.adapting = false;
        Ok(())
    }

    fn set_monitor(&mut self, name: &str, thin: u64, kind: &str) -> Result<()> {
        ensure!(kind == "trace", "Unsupported monitor type {}", kind);
        ensure!(thin > 0, "Thinning interval must be positive");
        self.node(name)?;
        ensure!(
            !self.monitors.contains_key(name),
            "Monitor for {} is already set",
            name
        );
        self.monitors.insert(
            name.to_string(),
            Monitor {
                thin,
                samples: vec![vec![]; self.chains.len()],
            },
        );
        Ok(())
    }

    fn clear_monitor(&mut self, name: &str, kind: &str) -> Result<()> {
        ensure!(kind == "trace", "Unsupported monitor type {}", kind);
        self.monitors
            .remove(name)
            .with_context(|| format!("No monitor for {}", name))?;
        Ok(())
    }

    fn dump_monitors(&mut self, kind: &str, flat: bool) -> Result<DataMap> {
        ensure!(kind == "trace", "Unsupported monitor type {}", kind);
        self.monitors
            .iter()
            .map(|(name, monitor)| {
                let node = self.node(name)?;
                let size = node.size();
                let iterations = monitor.samples.first().map_or(0, |samples| samples.len() / size);

                let mut shape = vec![self.chains.len(), iterations];
                if flat {
                    shape.push(size);
                } else {
                    shape.extend_from_slice(&node.shape);
                }
                let order = (2..shape.len()).chain([1, 0]).collect_vec();
                let samples = ArrayD::from_shape_vec(IxDyn(&shape), monitor.samples.concat())?;
                let samples = samples.permuted_axes(order).as_standard_layout().into_owned();
                Ok((name.clone(), samples))
            })
            .collect()
    }

    fn dump_state(&mut self, kind: DumpKind, chain: usize) -> Result<StateDump> {
        ensure!(self.initialized, "Model is not initialized");
        let chain = &self.chains[chain_index(chain, self.chains.len())?];
        let values = self
            .nodes
            .iter()
            .filter_map(|node| {
                let current = &chain.values[&node.name];
                let values = match kind {
                    DumpKind::Data if node.is_observed() => node.data.clone(),
                    DumpKind::Parameters if node.is_free() => {
                        let mut values = current.clone();
                        Zip::from(&mut values).and(&node.observed).for_each(|value, &observed| {
                            if observed {
                                *value = MISSING;
                            }
                        });
                        values
                    }
                    DumpKind::All => current.clone(),
                    _ => return None,
                };
                Some((node.name.clone(), values))
            })
            .collect();
        Ok(StateDump {
            values,
            rng_name: Some(chain.rng_name.clone()),
        })
    }

    fn variable_names(&self) -> Vec<String> {
        self.declarations
            .iter()
            .flatten()
            .map(|decl| decl.name.clone())
            .collect()
    }

    fn nchain(&self) -> usize {
        self.chains.len()
    }

    fn iteration(&self) -> u64 {
        self.iteration
    }
}

/// Module loader and engine factory for `ToyEngine`.
#[derive(Debug, Default)]
pub struct ToyRuntime {
    modules: Mutex<Vec<String>>,
    loads: AtomicUsize,
    seed: Option<u32>,
}

impl ToyRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runtime whose parallel streams derive from `seed`.
    pub fn with_seed(seed: u32) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    /// How often a module was actually loaded.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Runtime for ToyRuntime {
    type Engine = ToyEngine;

    fn new_engine(&self) -> Result<ToyEngine> {
        Ok(ToyEngine::default())
    }

    fn missing_value(&self) -> f64 {
        MISSING
    }

    fn load_module(&self, name: &str) -> Result<()> {
        ensure!(MODULES.contains(&name), "Module {} not found", name);
        self.loads.fetch_add(1, Ordering::SeqCst);
        let mut modules = self.modules.lock().expect("Poisoned lock");
        if !modules.iter().any(|module| module == name) {
            modules.push(name.to_string());
        }
        Ok(())
    }

    fn unload_module(&self, name: &str) -> Result<()> {
        let mut modules = self.modules.lock().expect("Poisoned lock");
        let position = modules
            .iter()
            .position(|module| module == name)
            .with_context(|| format!("Module {} is not loaded", name))?;
        modules.remove(position);
        Ok(())
    }

    fn list_modules(&self) -> Vec<String> {
        self.modules.lock().expect("Poisoned lock").clone()
    }

    fn parallel_rngs(&self, factory: &str, streams: usize) -> Result<Vec<RngAssignment>> {
        ensure!(
            factory == PARALLEL_RNG,
            "Unknown random number generator factory {}",
            factory
        );
        ensure!(
            self.list_modules().iter().any(|module| module == "lecuyer"),
            "Factory {} needs the lecuyer module",
            factory
        );
        let seed = self.seed.unwrap_or_else(|| rand::rng().random()) as i64;
        Ok((0..streams)
            .map(|stream| RngAssignment {
                name: Some(factory.to_string()),
                init: Some(RngInit::State(vec![seed, stream as i64])),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use ndarray::arr1;
    use pretty_assertions::assert_eq;

    fn engine(text: &str, data: &DataMap, chains: usize) -> Result<ToyEngine> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(text.as_bytes())?;
        file.flush()?;
        let mut engine = ToyEngine::default();
        engine.check_model(file.path())?;
        engine.compile(data, chains, true)?;
        Ok(engine)
    }

    fn seeded(engine: &mut ToyEngine, seed: u32) -> Result<()> {
        for chain in 1..=engine.nchain() {
            let mut values = DataMap::new();
            RngAssignment::seeded(RNG_NAMES[0], seed + chain as u32).write_values(&mut values);
            engine.set_parameters(&values, chain)?;
        }
        Ok(())
    }

    #[test]
    fn parse_declarations() -> Result<()> {
        let decls = parse_model(
            "model {\n  p ~ dunif(0, 1)\n  x[2, 3] ~ dbern(0.5); y[] ~ dnorm(0, 0.1) # note\n}",
        )?;
        let names = decls.iter().map(|decl| decl.name.as_str()).collect_vec();
        assert_eq!(names, vec!["p", "x", "y"]);
        assert_eq!(decls[1].size, Size::Fixed(vec![2, 3]));
        assert_eq!(decls[2].size, Size::FromData);
        Ok(())
    }

    #[test]
    fn parse_errors() {
        assert!(parse_model("x ~ dbern(0.5)").is_err());
        assert!(parse_model("model { x ~ dbern(1.5) }").is_err());
        assert!(parse_model("model { x ~ dnorm(0, -1) }").is_err());
        assert!(parse_model("model { x ~ dunif(1, 0) }").is_err());
        assert!(parse_model("model { x ~ dgamma(1, 1) }").is_err());
        assert!(parse_model("model { x[0] ~ dbern(0.5) }").is_err());
        assert!(parse_model("model { x ~ dbern(0.5); x ~ dbern(0.1) }").is_err());
    }

    #[test]
    fn monitors_are_chain_last() -> Result<()> {
        let mut engine = engine("model { x[2] ~ dnorm(0, 1) }", &DataMap::new(), 3)?;
        seeded(&mut engine, 1)?;
        engine.initialize()?;
        engine.set_monitor("x", 1, "trace")?;
        engine.update(4)?;
        let samples = engine.dump_monitors("trace", false)?;
        assert_eq!(samples["x"].shape(), &[2, 4, 3]);

        let state = engine.dump_state(DumpKind::All, 2)?;
        assert_eq!(samples["x"][[0, 3, 1]], state.values["x"][[0]]);
        assert_eq!(samples["x"][[1, 3, 1]], state.values["x"][[1]]);

        let flat = engine.dump_monitors("trace", true)?;
        assert_eq!(flat["x"].shape(), &[2, 4, 3]);
        Ok(())
    }

    #[test]
    fn thinning_keeps_every_nth_iteration() -> Result<()> {
        let mut engine = engine("model { x ~ dbern(0.5) }", &DataMap::new(), 1)?;
        engine.initialize()?;
        engine.set_monitor("x", 3, "trace")?;
        engine.update(10)?;
        assert_eq!(engine.dump_monitors("trace", false)?["x"].shape(), &[1, 3, 1]);
        assert!(engine.set_monitor("x", 1, "trace").is_err());
        engine.clear_monitor("x", "trace")?;
        assert!(engine.clear_monitor("x", "trace").is_err());
        assert!(engine.set_monitor("x", 1, "mean").is_err());
        Ok(())
    }

    #[test]
    fn missing_data_is_sampled() -> Result<()> {
        let mut data = DataMap::new();
        data.insert("y".to_string(), arr1(&[1., MISSING, 0.]).into_dyn());
        let mut engine = engine("model { y[] ~ dbern(0.5) }", &data, 1)?;
        engine.initialize()?;
        engine.update(5)?;

        let data = engine.dump_state(DumpKind::Data, 1)?;
        assert!(is_missing(data.values["y"][[1]]));
        let params = engine.dump_state(DumpKind::Parameters, 1)?;
        assert!(is_missing(params.values["y"][[0]]));
        assert!(!is_missing(params.values["y"][[1]]));
        let all = engine.dump_state(DumpKind::All, 1)?;
        assert_eq!(all.values["y"][[2]], 0.);
        assert!(!engine.is_adapting());
        Ok(())
    }

    #[test]
    fn invalid_values_are_rejected() -> Result<()> {
        let mut data = DataMap::new();
        data.insert("y".to_string(), arr1(&[2.]).into_dyn());
        assert!(engine("model { y ~ dbern(0.5) }", &data, 1).is_err());

        let mut data = DataMap::new();
        data.insert("y".to_string(), arr1(&[1.]).into_dyn());
        let mut engine = engine("model { y ~ dbern(0.5)\n p ~ dunif(0, 1) }", &data, 2)?;
        let mut init = DataMap::new();
        init.insert("y".to_string(), arr1(&[0.]).into_dyn());
        assert!(engine.set_parameters(&init, 1).is_err());
        assert!(engine.set_rng_name("base::Nope", 1).is_err());
        assert!(engine.set_rng_name(RNG_NAMES[2], 3).is_err());
        Ok(())
    }

    #[test]
    fn initial_values_are_kept() -> Result<()> {
        let mut engine = engine("model { p ~ dunif(0, 1) }", &DataMap::new(), 1)?;
        let mut init = DataMap::new();
        init.insert("p".to_string(), arr1(&[0.25]).into_dyn());
        engine.set_parameters(&init, 1)?;
        engine.initialize()?;
        assert!(engine.is_adapting());
        assert_eq!(engine.dump_state(DumpKind::Parameters, 1)?.values["p"][[0]], 0.25);
        engine.adapt_off()?;
        assert!(!engine.is_adapting());
        Ok(())
    }

    #[test]
    fn seeds_make_chains_reproducible() -> Result<()> {
        let run = || -> Result<DataMap> {
            let mut engine = engine("model { p[3] ~ dnorm(1, 4) }", &DataMap::new(), 2)?;
            seeded(&mut engine, 7)?;
            engine.initialize()?;
            engine.set_monitor("p", 1, "trace")?;
            engine.update(20)?;
            engine.dump_monitors("trace", false)
        };
        let first = run()?;
        assert_eq!(first, run()?);
        assert_ne!(first["p"][[0, 0, 0]], first["p"][[0, 0, 1]]);
        Ok(())
    }

    #[test]
    fn largest_seed_reaches_chain() -> Result<()> {
        let mut engine = engine("model { p ~ dunif(0, 1) }", &DataMap::new(), 2)?;
        for (chain, seed) in [(1, u32::MAX), (2, u32::MAX - 1)] {
            let mut values = DataMap::new();
            RngAssignment::seeded(RNG_NAMES[0], seed).write_values(&mut values);
            engine.set_parameters(&values, chain)?;
        }
        assert_eq!(engine.chains[0].rng_init, Some(RngInit::Seed(u32::MAX)));
        assert_eq!(engine.chains[1].rng_init, Some(RngInit::Seed(u32::MAX - 1)));
        Ok(())
    }

    #[test]
    fn parallel_streams_need_lecuyer() -> Result<()> {
        let runtime = ToyRuntime::with_seed(3);
        assert!(runtime.parallel_rngs(PARALLEL_RNG, 2).is_err());
        runtime.load_module("lecuyer")?;
        assert!(runtime.parallel_rngs("base::BaseRNG", 2).is_err());
        let rngs = runtime.parallel_rngs(PARALLEL_RNG, 3)?;
        assert_eq!(rngs.len(), 3);
        assert!(rngs.iter().all_unique());
        Ok(())
    }
}
