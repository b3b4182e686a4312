use std::{
    io::Write,
    ops::RangeInclusive,
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;
use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{
    engine::{DumpKind, Engine, RngAssignment, RngInit, Runtime, RNG_SEED, RNG_STATE},
    executor::{CancelToken, ParallelUpdate},
    marshal::{self, DataSet, MaskedArray},
    modules::ModuleRegistry,
    progress::progress_reporter,
    router::{ChainRouter, MonitorGuard},
    Error, Result,
};

/// Lifecycle of a `Model`. `Model::adapt` moves a `Ready` model back to
/// `Adapting` while it runs and to `Ready` again once it returns, whether
/// or not it succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Unloaded,
    Compiled,
    Initialized,
    Adapting,
    Ready,
}

/// Initial values of one chain.
#[derive(Debug, Clone, Default)]
pub struct ChainInit {
    pub values: DataSet,
    /// Generator of the chain. Chains without one get a generator from the
    /// engine, or an independent stream if the chains run in parallel.
    pub rng: Option<RngAssignment>,
}

impl ChainInit {
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<MaskedArray>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with_rng(mut self, rng: RngAssignment) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Whether the generator of the chain was chosen by the caller, either
    /// through `rng` or through `.RNG.seed` / `.RNG.state` values.
    pub fn has_rng(&self) -> bool {
        self.rng.is_some()
            || self.values.contains_key(RNG_SEED)
            || self.values.contains_key(RNG_STATE)
    }
}

#[derive(Debug, Clone)]
pub enum InitialValues {
    /// The same values for every chain.
    Broadcast(ChainInit),
    /// One entry per chain.
    PerChain(Vec<ChainInit>),
}

impl Default for InitialValues {
    fn default() -> Self {
        Self::Broadcast(ChainInit::default())
    }
}

impl From<ChainInit> for InitialValues {
    fn from(init: ChainInit) -> Self {
        Self::Broadcast(init)
    }
}

impl From<Vec<ChainInit>> for InitialValues {
    fn from(inits: Vec<ChainInit>) -> Self {
        Self::PerChain(inits)
    }
}

impl InitialValues {
    fn per_chain(self, chains: usize) -> Result<Vec<ChainInit>> {
        match self {
            Self::Broadcast(init) => Ok(vec![init; chains]),
            Self::PerChain(inits) if inits.len() == chains => Ok(inits),
            Self::PerChain(inits) => Err(Error::Configuration(format!(
                "Got initial values for {} chains, but the model has {} chains",
                inits.len(),
                chains
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    /// File with the model source. Exactly one of `path` and `text` is required.
    pub path: Option<PathBuf>,
    /// Model source.
    pub text: Option<String>,
    /// Observed data. Masked entries are missing.
    pub data: DataSet,
    pub init: InitialValues,
    pub chains: usize,
    /// Number of adaptation iterations run when the model is created.
    pub tune: u64,
    /// Split the chains over several engine instances that run in parallel.
    /// `None` keeps all chains in one instance.
    pub chains_per_instance: Option<usize>,
    /// Upper limit for the number of worker threads. `None` uses one thread
    /// per engine instance.
    pub threads: Option<usize>,
    pub progress_bar: bool,
    /// Interval between progress updates. Batches of iterations are sized to
    /// take about this long.
    pub refresh: Duration,
    /// Modules loaded before the model is created.
    pub default_modules: Vec<String>,
    /// Generator factory for chains running in parallel.
    pub rng_factory: String,
    /// Module providing `rng_factory`.
    pub rng_module: Option<String>,
    /// Seed for the fallback when the runtime has no parallel streams.
    pub seed: Option<u64>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            path: None,
            text: None,
            data: DataSet::new(),
            init: InitialValues::default(),
            chains: 1,
            tune: 1000,
            chains_per_instance: None,
            threads: None,
            progress_bar: true,
            refresh: Duration::from_millis(500),
            default_modules: vec!["basemod".to_string(), "bugs".to_string()],
            rng_factory: "lecuyer::RngStream".to_string(),
            rng_module: Some("lecuyer".to_string()),
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleOptions {
    /// Variables to record. `None` records all variables of the model.
    pub vars: Option<Vec<String>>,
    /// Record every `thin`-th iteration.
    pub thin: u64,
    pub monitor_type: String,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            vars: None,
            thin: 1,
            monitor_type: "trace".to_string(),
        }
    }
}

/// Values of one chain, as returned by `Model::state` and friends.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    pub values: DataSet,
    pub rng_name: Option<String>,
}

/// Where the model source comes from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    Path(PathBuf),
    Text(String),
}

impl ModelSource {
    pub fn from_parts(path: Option<PathBuf>, text: Option<String>) -> Result<Self> {
        match (path, text) {
            (Some(path), None) => Ok(Self::Path(path)),
            (None, Some(text)) => Ok(Self::Text(text)),
            (None, None) => Err(Error::Configuration(
                "Either a model path or model text must be provided".to_string(),
            )),
            (Some(_), Some(_)) => Err(Error::Configuration(
                "Only one of model path and model text may be provided".to_string(),
            )),
        }
    }

    fn check<E: Engine>(&self, router: &mut ChainRouter<E>) -> Result<()> {
        match self {
            Self::Path(path) => router.check_model(path),
            Self::Text(text) => {
                let mut file =
                    NamedTempFile::new().context("Could not create a temporary model file")?;
                file.write_all(text.as_bytes())
                    .and_then(|()| file.flush())
                    .context("Could not write the temporary model file")?;
                router.check_model(file.path())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunOptions {
    progress_bar: bool,
    refresh: Duration,
    threads: Option<usize>,
}

fn run_updates<E: Engine>(
    router: &mut ChainRouter<E>,
    iterations: u64,
    header: &str,
    options: RunOptions,
    interrupt: &CancelToken,
) -> Result<()> {
    let total = iterations.saturating_mul(router.num_chains() as u64);
    let progress = progress_reporter(options.progress_bar, total, header, options.refresh);
    debug!(iterations, instances = router.num_instances(), "running updates");
    let result = ParallelUpdate::new(iterations, options.refresh, interrupt, progress.as_ref())
        .threads(options.threads)
        .run(router.shards_mut());
    // A pending interrupt is consumed by the run it stopped.
    interrupt.reset();
    result
}

fn unused_names<'a>(
    names: impl Iterator<Item = &'a String>,
    variables: &[String],
) -> Option<String> {
    let unused = names
        .filter(|name| !variables.contains(name))
        .filter(|name| name.as_str() != RNG_SEED && name.as_str() != RNG_STATE)
        .join(",");
    (!unused.is_empty()).then_some(unused)
}

/// Independent generators for chains that did not get one explicitly.
fn stream_rngs<R: Runtime>(runtime: &R, settings: &ModelSettings) -> Result<Vec<RngAssignment>> {
    let chains = settings.chains;
    match runtime.parallel_rngs(&settings.rng_factory, chains) {
        Ok(rngs) if rngs.len() == chains && rngs.iter().all_unique() => return Ok(rngs),
        Ok(rngs) => warn!(
            factory = %settings.rng_factory,
            streams = rngs.len(),
            "parallel generator returned unusable streams, deriving seeds instead"
        ),
        Err(err) => warn!(
            factory = %settings.rng_factory,
            "no parallel generator ({:#}), deriving seeds instead",
            err
        ),
    }

    let seed = settings.seed.unwrap_or_else(|| rand::rng().random());
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let seeds = std::iter::repeat_with(|| rng.random::<u32>())
        .unique()
        .take(chains)
        .collect_vec();
    Ok(seeds
        .into_iter()
        .map(|seed| RngAssignment {
            name: None,
            init: Some(RngInit::Seed(seed)),
        })
        .collect())
}

/// A compiled model whose chains may be spread over several engine
/// instances.
pub struct Model<R: Runtime> {
    router: ChainRouter<R::Engine>,
    variables: Vec<String>,
    missing: f64,
    stage: Stage,
    run_options: RunOptions,
    interrupt: CancelToken,
}

impl<R: Runtime> Model<R> {
    /// Load, compile and initialize a model and run `settings.tune`
    /// adaptation iterations.
    pub fn new(registry: &ModuleRegistry<R>, settings: ModelSettings) -> Result<Self> {
        let source = ModelSource::from_parts(settings.path.clone(), settings.text.clone())?;
        if settings.chains == 0 {
            return Err(Error::Configuration(
                "The number of chains must be positive".to_string(),
            ));
        }
        if settings.threads == Some(0) {
            return Err(Error::Configuration(
                "The number of threads must be positive".to_string(),
            ));
        }
        let chains_per_instance = settings.chains_per_instance.unwrap_or(settings.chains);
        if chains_per_instance == 0 {
            return Err(Error::Configuration(
                "The number of chains per engine instance must be positive".to_string(),
            ));
        }
        let inits = settings.init.clone().per_chain(settings.chains)?;
        let multi_instance = settings.chains > chains_per_instance;

        for module in settings.default_modules.iter() {
            registry.ensure_loaded(module)?;
        }
        if multi_instance {
            if let Some(module) = &settings.rng_module {
                registry.ensure_loaded(module)?;
            }
        }

        let runtime = registry.runtime();
        let missing = runtime.missing_value();
        let mut router =
            ChainRouter::build(settings.chains, chains_per_instance, || runtime.new_engine())?;
        source.check(&mut router)?;
        let variables = router.variable_names()?;

        let data = marshal::encode(&settings.data, missing);
        if let Some(unused) = unused_names(data.keys(), &variables) {
            return Err(Error::Configuration(format!(
                "Unused data for variables: {}",
                unused
            )));
        }
        let mut chain_values = Vec::with_capacity(inits.len());
        for (chain, init) in (1..=settings.chains).zip(inits.iter()) {
            let values = marshal::encode(&init.values, missing);
            if let Some(unused) = unused_names(values.keys(), &variables) {
                return Err(Error::Configuration(format!(
                    "Unused initial values in chain {} for variables: {}",
                    chain, unused
                )));
            }
            chain_values.push(values);
        }

        router.compile(&data, true)?;
        debug!(stage = ?Stage::Compiled, "model compiled");

        let streams = if multi_instance && !inits.iter().all(ChainInit::has_rng) {
            Some(stream_rngs(runtime.as_ref(), &settings)?)
        } else {
            None
        };
        for (index, (init, mut values)) in inits.iter().zip(chain_values).enumerate() {
            let chain = index + 1;
            let rng = match (&init.rng, &streams) {
                (Some(rng), _) => Some(rng),
                (None, Some(streams)) if !init.has_rng() => Some(&streams[index]),
                (None, _) => None,
            };
            if let Some(rng) = rng {
                if let Some(name) = &rng.name {
                    router.set_rng_name(name, chain)?;
                }
                rng.write_values(&mut values);
            }
            router.set_parameters(&values, chain)?;
        }

        router.initialize()?;
        info!(
            chains = settings.chains,
            instances = router.num_instances(),
            "initialized model"
        );

        let mut model = Self {
            router,
            variables,
            missing,
            stage: Stage::Initialized,
            run_options: RunOptions {
                progress_bar: settings.progress_bar,
                refresh: settings.refresh,
                threads: settings.threads,
            },
            interrupt: CancelToken::new(),
        };
        if settings.tune > 0 {
            model.adapt(settings.tune)?;
        } else {
            model.stage = Stage::Ready;
        }
        Ok(model)
    }

    /// Run `iterations` adaptation iterations. Returns true if the samplers
    /// reached their adaptation target.
    pub fn adapt(&mut self, iterations: u64) -> Result<bool> {
        if !self.router.is_adapting() {
            debug!("model does not need adaptation");
            self.stage = Stage::Ready;
            return Ok(true);
        }
        self.stage = Stage::Adapting;
        let adapted = run_updates(
            &mut self.router,
            iterations,
            "adapting: ",
            self.run_options,
            &self.interrupt,
        )
        .and_then(|()| self.router.check_adaptation());
        self.stage = Stage::Ready;
        adapted
    }

    /// Stop adapting the samplers.
    pub fn adapt_off(&mut self) -> Result<()> {
        self.router.adapt_off()?;
        self.stage = Stage::Ready;
        Ok(())
    }

    pub fn update(&mut self, iterations: u64) -> Result<()> {
        run_updates(
            &mut self.router,
            iterations,
            "updating: ",
            self.run_options,
            &self.interrupt,
        )
    }

    /// Run `iterations` updates and return the recorded samples, each with
    /// shape `(dims..., iterations / thin, chains)`.
    pub fn sample(&mut self, iterations: u64, options: &SampleOptions) -> Result<DataSet> {
        if options.thin == 0 {
            return Err(Error::Configuration(
                "The thinning interval must be positive".to_string(),
            ));
        }
        let vars = options
            .vars
            .clone()
            .unwrap_or_else(|| self.variables.clone());
        let kind = &options.monitor_type;

        let mut guard = MonitorGuard::acquire(&mut self.router, &vars, options.thin, kind)?;
        run_updates(
            &mut *guard,
            iterations,
            "sampling: ",
            self.run_options,
            &self.interrupt,
        )?;
        let samples = guard.dump_monitors(kind)?;
        guard.release()?;
        Ok(marshal::decode(samples, self.missing))
    }

    fn dump(&mut self, kind: DumpKind, chain: usize) -> Result<ChainState> {
        let dump = self.router.dump_state(kind, chain)?;
        Ok(ChainState {
            values: marshal::decode(dump.values, self.missing),
            rng_name: dump.rng_name,
        })
    }

    /// All values of every chain.
    pub fn state(&mut self) -> Result<Vec<ChainState>> {
        self.chains().map(|chain| self.dump(DumpKind::All, chain)).collect()
    }

    /// Values of the unobserved nodes of every chain.
    pub fn parameters(&mut self) -> Result<Vec<ChainState>> {
        self.chains()
            .map(|chain| self.dump(DumpKind::Parameters, chain))
            .collect()
    }

    /// Observed data. All chains share it, so only the first one is asked.
    pub fn data(&mut self) -> Result<DataSet> {
        Ok(self.dump(DumpKind::Data, 1)?.values)
    }

    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    pub fn num_chains(&self) -> usize {
        self.router.num_chains()
    }

    pub fn chains(&self) -> RangeInclusive<usize> {
        1..=self.router.num_chains()
    }

    /// Iterations run so far, including adaptation.
    pub fn iteration(&self) -> u64 {
        self.router.iteration()
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// A handle that stops running updates when cancelled.
    pub fn interrupt_handle(&self) -> CancelToken {
        self.interrupt.clone()
    }

    pub fn router(&self) -> &ChainRouter<R::Engine> {
        &self.router
    }
}
