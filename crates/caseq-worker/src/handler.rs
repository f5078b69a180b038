//! Job handler interface.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use caseq_models::{Job, Provider};
use caseq_queue::JobBroker;

use crate::error::{WorkerError, WorkerResult};

/// What a handler gets to see of the job it runs.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    provider: Option<Provider>,
    broker: Arc<dyn JobBroker>,
}

impl JobContext {
    pub fn new(job: Job, provider: Option<Provider>, broker: Arc<dyn JobBroker>) -> Self {
        Self {
            job,
            provider,
            broker,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Decode the payload into its queue-specific type.
    pub fn payload<P: DeserializeOwned>(&self) -> WorkerResult<P> {
        self.job
            .payload_as()
            .map_err(|e| WorkerError::invalid_payload(format!("{} payload: {}", self.job.queue, e)))
    }

    /// The provider this call was routed to, or `None` when the handler
    /// chooses one at call time.
    pub fn provider(&self) -> Option<Provider> {
        self.provider
    }

    /// Report progress (clamped to 0-100). Best-effort.
    pub async fn report_progress(&self, progress: u8) {
        let progress = progress.min(100);
        if let Err(e) = self.broker.report_progress(&self.job, progress).await {
            debug!(job_id = %self.job.id, "Failed to report progress: {}", e);
        }
    }
}

/// Processes jobs from one queue.
///
/// Handlers signal failure by returning an error. They must not redact,
/// report or dead-letter; the worker does that for every failure.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> WorkerResult<serde_json::Value>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = WorkerResult<serde_json::Value>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = WorkerResult<serde_json::Value>> + Send,
{
    async fn handle(&self, ctx: JobContext) -> WorkerResult<serde_json::Value> {
        (self.0)(ctx).await
    }
}
