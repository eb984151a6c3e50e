use std::time::Duration;
use thiserror::Error;

/// Result type for candidate execution.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Ways a candidate run can fail. None of them are retried at this layer.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("candidate exceeded its {}s deadline", .limit.as_secs())]
    CandidateTimeout { limit: Duration },

    #[error("candidate raised: {0}")]
    CandidateError(String),

    #[error("candidate returned a non-string answer: {0}")]
    InvalidAnswerShape(String),

    #[error("failed to launch candidate: {0}")]
    Launch(String),

    #[error("bridge protocol error: {0}")]
    Protocol(String),
}

impl RuntimeError {
    /// Answer text recorded for a failed sample. Always starts with `Error:`
    /// so scorers route it to zero.
    pub fn as_answer(&self) -> String {
        format!("Error: {}", self)
    }
}
