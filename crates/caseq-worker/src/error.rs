//! Worker error types.

use std::time::Duration;

use thiserror::Error;

use caseq_models::Provider;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// The external call itself failed (network, non-2xx, provider-side error).
    #[error("{provider} call failed: {message}")]
    Provider { provider: String, message: String },

    /// The call was refused before being attempted.
    #[error("circuit breaker open for {0}")]
    BreakerOpen(Provider),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("job stalled: {0}")]
    Stalled(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Job failed: {0}")]
    JobFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue error: {0}")]
    Queue(#[from] caseq_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn job_failed(msg: impl Into<String>) -> Self {
        Self::JobFailed(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Check if the call was declined by a breaker rather than attempted.
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, WorkerError::BreakerOpen(_))
    }

    /// Check if the error says something about the provider's health.
    ///
    /// Only these outcomes move a circuit breaker towards open.
    pub fn counts_against_provider(&self) -> bool {
        matches!(self, WorkerError::Provider { .. } | WorkerError::Timeout(_))
    }

    /// Short, stable name of the error category for diagnostics and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::Provider { .. } => "provider",
            WorkerError::BreakerOpen(_) => "breaker_open",
            WorkerError::Timeout(_) => "timeout",
            WorkerError::Stalled(_) => "stalled",
            WorkerError::InvalidPayload(_) => "invalid_payload",
            WorkerError::JobFailed(_) => "job_failed",
            WorkerError::ConfigError(_) => "config",
            WorkerError::Queue(_) => "queue",
            WorkerError::Io(_) => "io",
        }
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidPayload(e.to_string())
    }
}
