//! Queue broker interface.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use caseq_models::{Job, JobId, JobPayload, QueueName};

use crate::error::QueueResult;
use crate::options::{EnqueueOptions, JobCounts, TimingProfile};

/// Jobs recovered from a stalled-job sweep.
#[derive(Debug, Default)]
pub struct StalledBatch {
    /// Jobs whose lock expired and which may be run again
    pub reclaimed: Vec<Job>,
    /// Jobs that stalled more than `max_stalled_count` times
    pub exhausted: Vec<Job>,
}

impl StalledBatch {
    pub fn is_empty(&self) -> bool {
        self.reclaimed.is_empty() && self.exhausted.is_empty()
    }
}

/// A persistent, at-least-once, FIFO-per-queue job store.
///
/// The broker owns retry bookkeeping: it increments `attempts_made` on
/// every delivery and decides redelivery/backoff once a failure is
/// surfaced through [`JobBroker::fail`].
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Add a job to a queue.
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> QueueResult<JobId>;

    /// Lease up to `count` jobs for `consumer`, waiting at most `block`.
    async fn fetch(
        &self,
        queue: QueueName,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Job>>;

    /// Acknowledge a completed job so it is not redelivered.
    async fn ack(&self, job: &Job) -> QueueResult<()>;

    /// Surface a failed attempt; the broker retries it if attempts remain.
    async fn fail(&self, job: &Job, error: &str) -> QueueResult<()>;

    /// Take over jobs whose lock expired without an ack.
    async fn reclaim_stalled(
        &self,
        queue: QueueName,
        consumer: &str,
        timing: &TimingProfile,
    ) -> QueueResult<StalledBatch>;

    /// Publish handler progress (0-100).
    async fn report_progress(&self, job: &Job, progress: u8) -> QueueResult<()>;

    /// Job counts by state.
    async fn counts(&self, queue: QueueName) -> QueueResult<JobCounts>;

    /// Most recent jobs in a queue, newest first, without leasing them.
    async fn peek(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<Job>>;

    /// Delete a waiting job. Returns false if it was not found.
    async fn remove(&self, queue: QueueName, id: &JobId) -> QueueResult<bool>;

    /// Close broker connections. Further calls fail with `QueueError::Closed`.
    async fn close(&self) -> QueueResult<()>;
}

/// Enqueue a typed payload on its own queue.
pub async fn enqueue_payload<P: JobPayload>(
    broker: &dyn JobBroker,
    payload: &P,
    options: EnqueueOptions,
) -> QueueResult<JobId> {
    let queue = payload.queue();
    let options = if options.idempotency_key.is_none() {
        options.with_idempotency_key(payload.idempotency_key())
    } else {
        options
    };
    let value = serde_json::to_value(payload)?;
    let id = broker.enqueue(queue, value, options).await?;
    debug!(queue = %queue, job_id = %id, "Enqueued typed payload");
    Ok(id)
}
