use breeder_bench::BenchError;
use breeder_gateway::GatewayError;
use breeder_runtime::RuntimeError;
use breeder_store::StoreError;
use thiserror::Error;

/// Result type for the discovery loop.
pub type EvolveResult<T> = Result<T, EvolveError>;

/// Errors of the discovery loop.
#[derive(Debug, Error)]
pub enum EvolveError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Bench(#[from] BenchError),

    /// Too few descriptors to run density clustering.
    #[error("degenerate clustering: {0}")]
    DegenerateCluster(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A candidate could not be produced and was discarded.
    #[error("generation failed: {0}")]
    Generation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for EvolveError {
    fn from(e: config::ConfigError) -> Self {
        EvolveError::Config(e.to_string())
    }
}
