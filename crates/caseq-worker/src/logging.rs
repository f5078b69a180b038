//! Structured job logging.

use tracing::{error, info, warn, Span};

use caseq_models::{Job, QueueName};

/// Job logger carrying the fields every job event is tagged with.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    queue: QueueName,
    correlation_id: Option<String>,
}

impl JobLogger {
    pub fn new(job: &Job) -> Self {
        Self {
            job_id: job.id.to_string(),
            queue: job.queue,
            correlation_id: job.correlation_id.clone(),
        }
    }

    fn correlation(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or("-")
    }

    /// Log the start of an attempt.
    pub fn log_start(&self, attempt: u32, max_attempts: u32) {
        info!(
            job_id = %self.job_id,
            queue = %self.queue,
            correlation_id = self.correlation(),
            attempt,
            max_attempts,
            "Job started"
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            queue = %self.queue,
            correlation_id = self.correlation(),
            "Job warning: {}", message
        );
    }

    /// `message` must already be scrubbed.
    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            queue = %self.queue,
            correlation_id = self.correlation(),
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, elapsed_ms: u128) {
        info!(
            job_id = %self.job_id,
            queue = %self.queue,
            correlation_id = self.correlation(),
            elapsed_ms = elapsed_ms as u64,
            "Job completed"
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Create a tracing span for this job.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            queue = %self.queue,
            correlation_id = self.correlation()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_logger_creation() {
        let job = Job::new(QueueName::Email, json!({}), 5).with_correlation_id(Some("req-1".into()));
        let logger = JobLogger::new(&job);

        assert_eq!(logger.job_id(), job.id.to_string());
        assert_eq!(logger.queue(), QueueName::Email);
        assert_eq!(logger.correlation(), "req-1");
    }

    #[test]
    fn test_missing_correlation_id() {
        let job = Job::new(QueueName::Completeness, json!({}), 3);
        assert_eq!(JobLogger::new(&job).correlation(), "-");
    }
}
