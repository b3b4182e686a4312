//! Run many chains of a sampling engine on several threads.
//!
//! A [`Model`] spreads its chains over one or more engine instances, drives
//! them in parallel in batches of roughly constant duration, gives chains
//! running in parallel independent random number streams and translates
//! missing values between masked arrays and the engine's sentinel.
//!
//! ```no_run
//! use multichain_rs::{toy::ToyRuntime, Model, ModelSettings, ModuleRegistry, SampleOptions};
//!
//! let registry = ModuleRegistry::new(ToyRuntime::new());
//! let settings = ModelSettings {
//!     text: Some("model { p ~ dunif(0, 1) }".to_string()),
//!     chains: 4,
//!     chains_per_instance: Some(1),
//!     ..Default::default()
//! };
//! let mut model = Model::new(&registry, settings)?;
//! let samples = model.sample(1000, &SampleOptions::default())?;
//! assert_eq!(samples["p"].shape(), &[1, 1000, 4]);
//! # Ok::<(), multichain_rs::Error>(())
//! ```

pub mod engine;
mod error;
pub mod executor;
pub mod marshal;
mod model;
mod modules;
pub mod partition;
pub mod progress;
pub mod router;
pub mod toy;

pub use engine::{DataMap, DumpKind, Engine, RngAssignment, RngInit, Runtime, StateDump};
pub use error::{Error, Result};
pub use executor::{CancelToken, ParallelUpdate, Worker};
pub use marshal::{DataSet, MaskedArray};
pub use model::{
    ChainInit, ChainState, InitialValues, Model, ModelSettings, ModelSource, SampleOptions, Stage,
};
pub use modules::ModuleRegistry;
pub use partition::{const_time_partition, ConstTimePartition};
pub use progress::{NoProgress, ProgressBar, ProgressReporter};
pub use router::{ChainRouter, MonitorGuard, Route, Shard};
