//! Prometheus metrics emitted by workers and breakers.
//!
//! The recorder itself is installed by the HTTP layer that renders
//! `/metrics`; without a recorder these calls are no-ops.

use metrics::{counter, gauge, histogram};

use caseq_models::{Provider, QueueName};

use crate::circuit_breaker::CircuitState;

/// Metric names as constants for consistency.
pub mod names {
    // Job metrics
    pub const JOBS_COMPLETED_TOTAL: &str = "caseq_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "caseq_jobs_failed_total";
    pub const JOB_DURATION_SECONDS: &str = "caseq_job_duration_seconds";
    pub const STALLED_JOBS_TOTAL: &str = "caseq_stalled_jobs_total";

    // Dead-letter metrics
    pub const DEAD_LETTERS_TOTAL: &str = "caseq_dead_letters_total";
    pub const DEAD_LETTER_FAILURES_TOTAL: &str = "caseq_dead_letter_failures_total";

    // Breaker metrics
    pub const BREAKER_STATE: &str = "caseq_breaker_state";
    pub const BREAKER_REJECTIONS_TOTAL: &str = "caseq_breaker_rejections_total";
}

/// Record job completed.
pub fn record_job_completed(queue: QueueName, duration_secs: f64) {
    let labels = [("queue", queue.to_string())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a failed attempt.
pub fn record_job_failed(queue: QueueName, kind: &'static str, terminal: bool) {
    let labels = [
        ("queue", queue.to_string()),
        ("kind", kind.to_string()),
        ("terminal", terminal.to_string()),
    ];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

/// Record jobs reclaimed after their lock expired.
pub fn record_stalled(queue: QueueName, count: usize) {
    let labels = [("queue", queue.to_string())];
    counter!(names::STALLED_JOBS_TOTAL, &labels).increment(count as u64);
}

/// Record a dead-letter write.
pub fn record_dead_letter(queue: QueueName) {
    let labels = [("queue", queue.to_string())];
    counter!(names::DEAD_LETTERS_TOTAL, &labels).increment(1);
}

/// Record a dead-letter write that failed.
pub fn record_dead_letter_failure(queue: QueueName) {
    let labels = [("queue", queue.to_string())];
    counter!(names::DEAD_LETTER_FAILURES_TOTAL, &labels).increment(1);
}

/// Update the breaker state gauge (0 closed, 1 half-open, 2 open).
pub fn set_breaker_state(provider: Provider, state: CircuitState) {
    let labels = [("provider", provider.to_string())];
    gauge!(names::BREAKER_STATE, &labels).set(state.as_gauge());
}

/// Record a call refused by an open breaker.
pub fn record_breaker_rejection(provider: Provider) {
    let labels = [("provider", provider.to_string())];
    counter!(names::BREAKER_REJECTIONS_TOTAL, &labels).increment(1);
}
