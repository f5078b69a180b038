//! Diagnostics sink for job failures.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, warn};

use caseq_models::{JobId, QueueName};

/// What the worker attaches to a failure report.
///
/// Built only from redacted data: the payload has been through the
/// allowlist and the error through the scrubber.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureContext {
    pub queue: QueueName,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub redacted_payload: serde_json::Value,
    pub attempts_made: u32,
    pub max_attempts: u32,
    /// Stable error category, e.g. `provider` or `breaker_open`
    pub error_kind: &'static str,
    /// Whether this was the last permitted attempt
    pub terminal: bool,
}

/// External error-reporting service.
///
/// Reporting is best-effort: implementations log their own failures and
/// never propagate them into the job's failure path.
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    async fn report_failure(&self, error: &str, context: &FailureContext);
}

/// Default sink: structured tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDiagnostics;

#[async_trait]
impl DiagnosticsSink for TracingDiagnostics {
    async fn report_failure(&self, error: &str, context: &FailureContext) {
        if context.terminal {
            error!(
                queue = %context.queue,
                job_id = %context.job_id,
                correlation_id = context.correlation_id.as_deref().unwrap_or("-"),
                attempts = context.attempts_made,
                max_attempts = context.max_attempts,
                kind = context.error_kind,
                payload = %context.redacted_payload,
                "Job failed permanently: {}", error
            );
        } else {
            warn!(
                queue = %context.queue,
                job_id = %context.job_id,
                correlation_id = context.correlation_id.as_deref().unwrap_or("-"),
                attempts = context.attempts_made,
                max_attempts = context.max_attempts,
                kind = context.error_kind,
                payload = %context.redacted_payload,
                "Job attempt failed: {}", error
            );
        }
    }
}
