//! Per-queue worker.
//!
//! One consumer loop per queue keeps up to `concurrency` jobs in flight.
//! Each job is routed to a call policy, run, and then either acked or sent
//! through the failure path before the failure is surfaced to the broker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use caseq_models::{Job, QueueName};
use caseq_queue::{JobBroker, QueueError, QueueOptions};

use crate::config::WorkerConfig;
use crate::dead_letter::DeadLetterForwarder;
use crate::diagnostics::DiagnosticsSink;
use crate::error::{WorkerError, WorkerResult};
use crate::failure::{FailureReport, FailureReporter};
use crate::handler::{JobContext, JobHandler};
use crate::logging::JobLogger;
use crate::metrics;
use crate::redact::scrub;
use crate::retry::{retry_async_when, FailureTracker, RetryConfig, RetryResult};
use crate::routing::ProviderRouter;

/// Most jobs leased in one fetch.
const MAX_FETCH_BATCH: usize = 5;

/// Collaborators shared by every queue worker in the process.
#[derive(Clone)]
pub struct WorkerContext {
    pub broker: Arc<dyn JobBroker>,
    pub router: Arc<ProviderRouter>,
    pub failures: FailureReporter,
}

impl WorkerContext {
    pub fn new(
        broker: Arc<dyn JobBroker>,
        router: Arc<ProviderRouter>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Self {
        let failures = FailureReporter::new(diagnostics, DeadLetterForwarder::new(Arc::clone(&broker)));
        Self {
            broker,
            router,
            failures,
        }
    }
}

/// Everything a spawned job task needs.
struct Dispatcher {
    queue: QueueName,
    options: QueueOptions,
    ctx: WorkerContext,
    handler: Arc<dyn JobHandler>,
    broker_retry: RetryConfig,
}

impl Dispatcher {
    async fn execute(self: Arc<Self>, job: Job) {
        let logger = JobLogger::new(&job);
        let span = logger.create_span();
        self.run_job(job, logger).instrument(span).await
    }

    async fn run_job(&self, job: Job, logger: JobLogger) {
        logger.log_start(job.attempts_made, job.max_attempts);
        let started = Instant::now();

        let outcome = match self.ctx.router.select(&job) {
            Ok(policy) => {
                let context =
                    JobContext::new(job.clone(), policy.provider(), Arc::clone(&self.ctx.broker));
                policy
                    .run(self.options.handler_timeout, self.handler.handle(context))
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(_) => self.complete(&job, &logger, started).await,
            Err(e) => {
                self.handle_failure(&job, e).await;
            }
        }
    }

    async fn complete(&self, job: &Job, logger: &JobLogger, started: Instant) {
        let elapsed = started.elapsed();
        logger.log_completion(elapsed.as_millis());

        let acked = retry_async_when(
            &self.broker_retry,
            || self.ctx.broker.ack(job),
            QueueError::is_transient,
        )
        .await;

        match acked {
            RetryResult::Success(()) => {
                metrics::record_job_completed(self.queue, elapsed.as_secs_f64());
            }
            RetryResult::Failed { error, attempts } => {
                // The job ran; the broker will hand it out again once the lock
                // expires, so the handler must be idempotent.
                logger.log_warning(&format!(
                    "ack failed after {attempts} attempts, job will be redelivered: {error}"
                ));
            }
        }
    }

    /// Report, dead-letter if final, then surface the failure to the broker.
    async fn handle_failure(&self, job: &Job, error: WorkerError) -> FailureReport {
        let report = self.ctx.failures.report(job, &error).await;

        let surfaced = retry_async_when(
            &self.broker_retry,
            || self.ctx.broker.fail(job, &report.redacted_error),
            QueueError::is_transient,
        )
        .await;

        if let RetryResult::Failed { error, attempts } = surfaced {
            JobLogger::new(job).log_error(&format!(
                "failure not recorded by broker after {attempts} attempts: {}",
                scrub(&error.to_string())
            ));
        }

        report
    }
}

/// Worker that consumes one queue.
pub struct QueueWorker {
    dispatcher: Arc<Dispatcher>,
    semaphore: Arc<Semaphore>,
    shutdown: Arc<watch::Sender<bool>>,
    consumer_name: String,
    fetch_block: Duration,
    error_backoff: Duration,
    shutdown_timeout: Duration,
}

impl QueueWorker {
    /// Create a worker for `queue`.
    ///
    /// Fails with a configuration error if the queue's lock could expire
    /// while a handler or breaker-wrapped call is still within its timeout.
    pub fn new(
        queue: QueueName,
        options: QueueOptions,
        ctx: WorkerContext,
        handler: Arc<dyn JobHandler>,
    ) -> WorkerResult<Self> {
        if queue == QueueName::DeadLetter {
            return Err(WorkerError::config_error("the dead-letter queue has no worker"));
        }
        options
            .validate()
            .map_err(|e| WorkerError::config_error(format!("{queue}: {e}")))?;

        for &provider in WorkerConfig::providers_for(queue) {
            let call_timeout = ctx.router.breakers().get(provider)?.config().call_timeout;
            if call_timeout >= options.timing.lock_duration {
                return Err(WorkerError::config_error(format!(
                    "{queue}: {provider} call timeout {call_timeout:?} must be below lock duration {:?}",
                    options.timing.lock_duration
                )));
            }
        }

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            dispatcher: Arc::new(Dispatcher {
                queue,
                options,
                ctx,
                handler,
                broker_retry: RetryConfig::new(format!("{queue} broker bookkeeping")),
            }),
            semaphore: Arc::new(Semaphore::new(options.concurrency)),
            shutdown: Arc::new(shutdown),
            consumer_name: format!("worker-{}-{}", queue, Uuid::new_v4()),
            fetch_block: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        })
    }

    /// Apply the process-wide timings from config.
    pub fn with_config(mut self, config: &WorkerConfig) -> Self {
        self.fetch_block = config.fetch_block;
        self.error_backoff = config.error_backoff;
        self.shutdown_timeout = config.shutdown_timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_fetch_block(mut self, block: Duration) -> Self {
        self.fetch_block = block;
        self
    }

    pub fn queue(&self) -> QueueName {
        self.dispatcher.queue
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Run the consumer loop until [`QueueWorker::shutdown`] is called, then
    /// wait up to the shutdown timeout for in-flight jobs.
    pub async fn run(&self) -> WorkerResult<()> {
        let queue = self.dispatcher.queue;
        info!(
            queue = %queue,
            consumer = %self.consumer_name,
            concurrency = self.dispatcher.options.concurrency,
            "Starting queue worker"
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let stalled_task = tokio::spawn(Self::sweep_stalled(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.semaphore),
            self.consumer_name.clone(),
        ));

        let mut failures = FailureTracker::new(3);
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                result = self.consume_jobs() => match result {
                    Ok(()) => failures.record_success(),
                    Err(e) => {
                        if failures.record_failure() {
                            error!(queue = %queue, "Error consuming jobs: {}", e);
                        }
                        tokio::select! {
                            _ = shutdown_rx.changed() => {}
                            _ = tokio::time::sleep(self.error_backoff) => {}
                        }
                    }
                }
            }
        }

        info!(queue = %queue, "Shutdown signal received, no longer fetching jobs");
        stalled_task.abort();

        if self.wait_for_jobs().await {
            info!(queue = %queue, "Queue worker stopped");
        } else {
            warn!(
                queue = %queue,
                timeout_secs = self.shutdown_timeout.as_secs(),
                in_flight = self.in_flight(),
                "Timed out waiting for in-flight jobs"
            );
        }
        Ok(())
    }

    /// Run the worker on its own task.
    pub fn spawn(self) -> WorkerHandle {
        let queue = self.dispatcher.queue;
        let shutdown = Arc::clone(&self.shutdown);
        let task = tokio::spawn(async move { self.run().await });
        WorkerHandle {
            queue,
            shutdown,
            task,
        }
    }

    /// Signal shutdown. The flag is stored even before `run` subscribes.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.options.concurrency - self.semaphore.available_permits()
    }

    /// Run one leased job through its handler and the success or failure path.
    pub async fn process(&self, job: Job) {
        Arc::clone(&self.dispatcher).execute(job).await
    }

    /// Lease jobs for every free concurrency slot (at least one) and start them.
    async fn consume_jobs(&self) -> WorkerResult<()> {
        let first = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::job_failed("Semaphore closed"))?;

        let mut permits = vec![first];
        while permits.len() < MAX_FETCH_BATCH {
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }

        let jobs = self
            .dispatcher
            .ctx
            .broker
            .fetch(
                self.dispatcher.queue,
                &self.consumer_name,
                permits.len(),
                self.fetch_block,
            )
            .await?;

        if jobs.is_empty() {
            return Ok(());
        }

        debug!(queue = %self.dispatcher.queue, count = jobs.len(), "Leased jobs");

        // Unused permits are released when `permits` drops.
        for (job, permit) in jobs.into_iter().zip(permits) {
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                let _permit = permit;
                dispatcher.execute(job).await;
            });
        }

        Ok(())
    }

    /// Periodically take over jobs whose lock expired.
    ///
    /// Reclaimed jobs run again; jobs that stalled too often are failed as
    /// an attempt so the broker's retry budget applies to them.
    async fn sweep_stalled(dispatcher: Arc<Dispatcher>, semaphore: Arc<Semaphore>, consumer: String) {
        let queue = dispatcher.queue;
        let timing = dispatcher.options.timing;
        let mut interval = tokio::time::interval(timing.stalled_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = FailureTracker::new(3);

        loop {
            interval.tick().await;

            let batch = match dispatcher
                .ctx
                .broker
                .reclaim_stalled(queue, &consumer, &timing)
                .await
            {
                Ok(batch) => {
                    failures.record_success();
                    batch
                }
                Err(e) => {
                    if failures.record_failure() {
                        warn!(queue = %queue, "Failed to check for stalled jobs: {}", e);
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                continue;
            }

            info!(
                queue = %queue,
                reclaimed = batch.reclaimed.len(),
                exhausted = batch.exhausted.len(),
                "Recovered stalled jobs"
            );
            metrics::record_stalled(queue, batch.reclaimed.len() + batch.exhausted.len());

            for job in batch.exhausted {
                let error = WorkerError::Stalled(format!(
                    "lock expired more than {} times",
                    timing.max_stalled_count
                ));
                dispatcher.handle_failure(&job, error).await;
            }

            for job in batch.reclaimed {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    return;
                };
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    let _permit = permit;
                    dispatcher.execute(job).await;
                });
            }
        }
    }

    /// Wait for all in-flight jobs. Returns false on timeout.
    async fn wait_for_jobs(&self) -> bool {
        let all = self.dispatcher.options.concurrency as u32;
        matches!(
            tokio::time::timeout(self.shutdown_timeout, self.semaphore.acquire_many(all)).await,
            Ok(Ok(_))
        )
    }
}

/// A worker running on its own task.
pub struct WorkerHandle {
    queue: QueueName,
    shutdown: Arc<watch::Sender<bool>>,
    task: JoinHandle<WorkerResult<()>>,
}

impl WorkerHandle {
    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// Stop fetching, drain in-flight jobs and wait for the loop to exit.
    pub async fn shutdown(self) -> WorkerResult<()> {
        self.shutdown.send_replace(true);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(WorkerError::job_failed(format!(
                "{} worker task ended abnormally: {}",
                self.queue, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use caseq_models::Provider;
    use caseq_queue::{EnqueueOptions, MemoryBroker, TimingProfile};
    use serde_json::json;

    use crate::diagnostics::TracingDiagnostics;
    use crate::handler::handler_fn;
    use crate::routing::Breakers;

    fn context(broker: Arc<MemoryBroker>) -> WorkerContext {
        let breakers = Arc::new(Breakers::from_config(&WorkerConfig::default()));
        WorkerContext::new(
            broker,
            Arc::new(ProviderRouter::new(breakers, Provider::Anthropic)),
            Arc::new(TracingDiagnostics),
        )
    }

    fn ok_handler() -> Arc<dyn JobHandler> {
        Arc::new(handler_fn(|_ctx: JobContext| async { Ok(json!({"ok": true})) }))
    }

    #[test]
    fn test_rejects_lock_shorter_than_breaker_timeout() {
        let broker = Arc::new(MemoryBroker::new());
        let options = QueueOptions::for_queue(QueueName::DocumentAnalysis)
            .with_handler_timeout(Duration::from_secs(60))
            .with_timing(TimingProfile::DELIVERY);

        let result = QueueWorker::new(QueueName::DocumentAnalysis, options, context(broker), ok_handler());
        assert!(matches!(result, Err(WorkerError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_dead_letter_queue() {
        let broker = Arc::new(MemoryBroker::new());
        let options = QueueOptions::for_queue(QueueName::DeadLetter);
        let result = QueueWorker::new(QueueName::DeadLetter, options, context(broker), ok_handler());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_success_acks_job() {
        let broker = Arc::new(MemoryBroker::new());
        let worker = QueueWorker::new(
            QueueName::Email,
            QueueOptions::for_queue(QueueName::Email),
            context(broker.clone()),
            ok_handler(),
        )
        .unwrap();

        broker
            .enqueue(QueueName::Email, json!({"userId": "u1"}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = broker
            .fetch(QueueName::Email, "test", 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);

        worker.process(job).await;

        let counts = broker.counts(QueueName::Email).await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn test_non_final_failure_is_retried_not_dead_lettered() {
        let broker = Arc::new(MemoryBroker::new());
        let calls = Arc::new(AtomicU32::new(0));
        let handler = {
            let calls = Arc::clone(&calls);
            Arc::new(handler_fn(move |_ctx: JobContext| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(WorkerError::provider("anthropic", "overloaded")) }
            }))
        };
        let worker = QueueWorker::new(
            QueueName::Recommendations,
            QueueOptions::for_queue(QueueName::Recommendations),
            context(broker.clone()),
            handler,
        )
        .unwrap();

        broker
            .enqueue(QueueName::Recommendations, json!({"caseId": "c1"}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = broker
            .fetch(QueueName::Recommendations, "test", 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);
        assert_eq!(job.attempts_made, 1);

        worker.process(job).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.counts(QueueName::Recommendations).await.unwrap().waiting, 1);
        assert_eq!(broker.counts(QueueName::DeadLetter).await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_shutdown_sent_before_loop_starts_is_not_lost() {
        let broker = Arc::new(MemoryBroker::new());
        let worker = QueueWorker::new(
            QueueName::Email,
            QueueOptions::for_queue(QueueName::Email),
            context(broker.clone()),
            ok_handler(),
        )
        .unwrap();

        // On the current-thread runtime the spawned loop has not run yet.
        let handle = worker.spawn();
        let stopped = tokio::time::timeout(Duration::from_secs(3), handle.shutdown()).await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_shutdown_before_run_returns_immediately() {
        let broker = Arc::new(MemoryBroker::new());
        let worker = QueueWorker::new(
            QueueName::Email,
            QueueOptions::for_queue(QueueName::Email),
            context(broker.clone()),
            ok_handler(),
        )
        .unwrap();

        worker.shutdown();
        let stopped = tokio::time::timeout(Duration::from_secs(3), worker.run()).await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_failure_the_broker_cannot_record_is_logged_not_raised() {
        let broker = Arc::new(MemoryBroker::new());
        let calls = Arc::new(AtomicU32::new(0));
        let handler = {
            let calls = Arc::clone(&calls);
            Arc::new(handler_fn(move |_ctx: JobContext| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(WorkerError::provider("anthropic", "overloaded")) }
            }))
        };
        let worker = QueueWorker::new(
            QueueName::Completeness,
            QueueOptions::for_queue(QueueName::Completeness),
            context(broker.clone()),
            handler,
        )
        .unwrap();

        broker
            .enqueue(QueueName::Completeness, json!({"caseId": "c1"}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = broker
            .fetch(QueueName::Completeness, "test", 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0);
        broker.close().await.unwrap();

        let processed = tokio::time::timeout(Duration::from_secs(5), worker.process(job)).await;
        assert!(processed.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
