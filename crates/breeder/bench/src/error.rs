use thiserror::Error;

/// Result type for benchmark operations.
pub type BenchResult<T> = Result<T, BenchError>;

/// Errors raised while loading or scoring benchmark data.
#[derive(Debug, Clone, Error)]
pub enum BenchError {
    #[error("dataset error: {0}")]
    Dataset(String),

    /// A scorer could not produce a value. The sample counts as zero.
    #[error("scorer error: {0}")]
    Scorer(String),

    #[error("unknown benchmark: {0}")]
    UnknownBenchmark(String),
}

impl From<breeder_gateway::GatewayError> for BenchError {
    fn from(e: breeder_gateway::GatewayError) -> Self {
        BenchError::Scorer(e.to_string())
    }
}
