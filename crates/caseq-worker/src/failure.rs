//! The single place where job failures are redacted, reported and
//! dead-lettered. Handlers return errors; they never report them.

use std::sync::Arc;

use caseq_models::Job;

use crate::dead_letter::{DeadLetterForwarder, ForwardOutcome};
use crate::diagnostics::{DiagnosticsSink, FailureContext};
use crate::error::WorkerError;
use crate::metrics;
use crate::redact::{filter_payload, scrub};

/// Result of running a failed attempt through the failure path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// Scrubbed error message, safe to hand to the broker
    pub redacted_error: String,
    pub dead_letter: ForwardOutcome,
}

#[derive(Clone)]
pub struct FailureReporter {
    diagnostics: Arc<dyn DiagnosticsSink>,
    dead_letters: DeadLetterForwarder,
}

impl FailureReporter {
    pub fn new(diagnostics: Arc<dyn DiagnosticsSink>, dead_letters: DeadLetterForwarder) -> Self {
        Self {
            diagnostics,
            dead_letters,
        }
    }

    /// Report a failed attempt, then dead-letter it if it was the last one.
    ///
    /// Infallible: the caller always gets to surface the failure to the broker.
    pub async fn report(&self, job: &Job, error: &WorkerError) -> FailureReport {
        let redacted_error = scrub(&error.to_string());
        let terminal = job.is_final_attempt();

        let context = FailureContext {
            queue: job.queue,
            job_id: job.id.clone(),
            correlation_id: job.correlation_id.clone(),
            redacted_payload: filter_payload(&job.payload),
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            error_kind: error.kind(),
            terminal,
        };

        self.diagnostics.report_failure(&redacted_error, &context).await;
        metrics::record_job_failed(job.queue, error.kind(), terminal);

        let dead_letter = self.dead_letters.forward(job, &redacted_error).await;

        FailureReport {
            redacted_error,
            dead_letter,
        }
    }
}
