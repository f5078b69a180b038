//! Dead-letter forwarding for terminally-failed jobs.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use caseq_models::{DeadLetterRecord, Job, JobId, QueueName};
use caseq_queue::{EnqueueOptions, JobBroker};

use crate::metrics;
use crate::redact::{filter_payload, scrub};

/// What happened when a failure was offered to the forwarder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Attempts remain; the broker will retry the job.
    NotFinal,
    /// A record was written to the dead-letter queue.
    Forwarded(JobId),
    /// The write failed. Already logged.
    WriteFailed,
}

impl ForwardOutcome {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, ForwardOutcome::Forwarded(_))
    }
}

/// Build the redacted record for a failed job.
pub fn dead_letter_record(job: &Job, error: &str) -> DeadLetterRecord {
    DeadLetterRecord {
        original_queue: job.queue,
        original_job_id: job.id.clone(),
        redacted_payload: filter_payload(&job.payload),
        redacted_error: scrub(error),
        failed_at: Utc::now(),
        attempts_made: job.attempts_made,
        correlation_id: job.correlation_id.clone(),
    }
}

/// Writes terminal-failure records to the dead-letter queue.
#[derive(Clone)]
pub struct DeadLetterForwarder {
    broker: Arc<dyn JobBroker>,
}

impl DeadLetterForwarder {
    pub fn new(broker: Arc<dyn JobBroker>) -> Self {
        Self { broker }
    }

    /// Persist a record if this failure was the job's last permitted attempt.
    ///
    /// Never fails: a broken dead-letter write is logged and counted, and the
    /// caller carries on reporting the original failure.
    pub async fn forward(&self, job: &Job, error: &str) -> ForwardOutcome {
        if !job.is_final_attempt() {
            debug!(
                queue = %job.queue,
                job_id = %job.id,
                attempts = job.attempts_made,
                max_attempts = job.max_attempts,
                "Attempts remain, not dead-lettering"
            );
            return ForwardOutcome::NotFinal;
        }

        let record = dead_letter_record(job, error);
        let payload = match serde_json::to_value(&record) {
            Ok(payload) => payload,
            Err(e) => {
                error!(queue = %job.queue, job_id = %job.id, "Failed to encode dead-letter record: {}", e);
                metrics::record_dead_letter_failure(job.queue);
                return ForwardOutcome::WriteFailed;
            }
        };

        let mut options = EnqueueOptions::dead_letter();
        if let Some(correlation_id) = &job.correlation_id {
            options = options.with_correlation_id(correlation_id.clone());
        }

        match self
            .broker
            .enqueue(QueueName::DeadLetter, payload, options)
            .await
        {
            Ok(record_id) => {
                info!(
                    queue = %job.queue,
                    job_id = %job.id,
                    dead_letter_id = %record_id,
                    attempts = job.attempts_made,
                    "Job moved to dead-letter queue"
                );
                metrics::record_dead_letter(job.queue);
                ForwardOutcome::Forwarded(record_id)
            }
            Err(e) => {
                error!(
                    queue = %job.queue,
                    job_id = %job.id,
                    "Failed to write dead-letter record: {}", e
                );
                metrics::record_dead_letter_failure(job.queue);
                ForwardOutcome::WriteFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseq_queue::MemoryBroker;
    use serde_json::json;

    fn failed_job(queue: QueueName, attempts_made: u32, max_attempts: u32) -> Job {
        let mut job = Job::new(
            queue,
            json!({"userId": "u1", "ssn": "123-45-6789", "documentId": "d1"}),
            max_attempts,
        );
        job.attempts_made = attempts_made;
        job
    }

    #[tokio::test]
    async fn test_forwards_only_on_final_attempt() {
        let broker = Arc::new(MemoryBroker::new());
        let forwarder = DeadLetterForwarder::new(broker.clone());

        for attempt in 1..=2 {
            let job = failed_job(QueueName::DocumentAnalysis, attempt, 3);
            assert_eq!(forwarder.forward(&job, "boom").await, ForwardOutcome::NotFinal);
        }
        assert_eq!(broker.counts(QueueName::DeadLetter).await.unwrap().waiting, 0);

        let job = failed_job(QueueName::DocumentAnalysis, 3, 3);
        assert!(forwarder.forward(&job, "boom").await.is_forwarded());
        assert_eq!(broker.counts(QueueName::DeadLetter).await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_record_is_redacted() {
        let broker = Arc::new(MemoryBroker::new());
        let forwarder = DeadLetterForwarder::new(broker.clone());
        let job = failed_job(QueueName::Email, 1, 1).with_correlation_id(Some("req-7".into()));

        forwarder.forward(&job, "123-45-6789 invalid").await;

        let stored = broker.peek(QueueName::DeadLetter, 1).await.unwrap();
        let record = DeadLetterRecord::from_dead_letter_job(&stored[0]).unwrap();
        assert_eq!(record.original_queue, QueueName::Email);
        assert_eq!(record.original_job_id, job.id);
        assert_eq!(record.attempts_made, 1);
        assert_eq!(record.redacted_error, "[SSN] invalid");
        assert_eq!(record.redacted_payload, json!({"userId": "u1", "documentId": "d1"}));
        assert_eq!(record.correlation_id.as_deref(), Some("req-7"));
        assert_eq!(stored[0].max_attempts, 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_swallowed() {
        let broker = Arc::new(MemoryBroker::new());
        broker.close().await.unwrap();
        let forwarder = DeadLetterForwarder::new(broker);

        let job = failed_job(QueueName::Email, 5, 5);
        assert_eq!(forwarder.forward(&job, "smtp 550").await, ForwardOutcome::WriteFailed);
    }
}
