use std::time::Duration;
use thiserror::Error;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway-layer errors.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("rate limited by provider")]
    RateLimited {
        /// Provider-suggested wait, when one was sent.
        retry_after: Option<Duration>,
    },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("invalid gateway configuration: {0}")]
    InvalidConfig(String),
}

impl GatewayError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. } | GatewayError::Upstream(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(GatewayError::RateLimited { retry_after: None }.is_transient());
        assert!(GatewayError::Upstream("503".into()).is_transient());
        assert!(!GatewayError::MalformedResponse("x".into()).is_transient());
        assert!(!GatewayError::InvalidConfig("x".into()).is_transient());
    }

    #[test]
    fn display_includes_reason() {
        let e = GatewayError::MalformedResponse("missing keys: code".into());
        assert!(e.to_string().contains("missing keys"));
    }
}
