use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The model was configured inconsistently. Raised before any worker starts.
    #[error("Invalid model configuration: {0}")]
    Configuration(String),
    #[error("Chain {chain} is not in 1..={num_chains}")]
    ChainOutOfRange { chain: usize, num_chains: usize },
    /// The routing table and the engine instances disagree. This is an
    /// internal consistency fault.
    #[error("Inconsistent chain routing: {0}")]
    Routing(String),
    /// An update batch failed on one of the worker threads.
    #[error("Update failed on engine instance {instance}")]
    Execution {
        instance: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Sampling was interrupted")]
    Interrupted,
    #[error(transparent)]
    Engine(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
