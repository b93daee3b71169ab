//! Error types shared across the crate

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors produced by the context optimization pipeline
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("LLM backend error: {0}")]
    Backend(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Circuit breaker '{name}' is open, retry in {retry_after_ms}ms")]
    BreakerOpen { name: String, retry_after_ms: u64 },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ContextError {
    /// True when the error is a fast-fail rejection from an open circuit
    /// breaker rather than an actual operation failure.
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, ContextError::BreakerOpen { .. })
    }
}
