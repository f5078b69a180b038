//! End-to-end worker behavior against the in-memory broker.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use caseq_models::{DeadLetterRecord, Job, JobId, Provider, QueueName};
use caseq_queue::{
    EnqueueOptions, JobBroker, JobCounts, MemoryBroker, QueueError, QueueOptions, QueueResult,
    StalledBatch, TimingProfile,
};
use caseq_worker::{
    handler_fn, Breakers, CircuitState, CleanupPhase, DiagnosticsSink, FailureContext,
    JobContext, JobHandler, LifecycleCoordinator, ProviderRouter, QueueWorker, WorkerConfig,
    WorkerContext, WorkerError,
};

/// Diagnostics sink that keeps every report.
#[derive(Default)]
struct RecordingDiagnostics {
    reports: Mutex<Vec<(String, FailureContext)>>,
}

impl RecordingDiagnostics {
    fn reports(&self) -> Vec<(String, FailureContext)> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl DiagnosticsSink for RecordingDiagnostics {
    async fn report_failure(&self, error: &str, context: &FailureContext) {
        self.reports
            .lock()
            .unwrap()
            .push((error.to_string(), context.clone()));
    }
}

struct Harness {
    broker: Arc<dyn JobBroker>,
    memory: Arc<MemoryBroker>,
    breakers: Arc<Breakers>,
    diagnostics: Arc<RecordingDiagnostics>,
    ctx: WorkerContext,
}

impl Harness {
    fn new() -> Self {
        let memory = Arc::new(MemoryBroker::new());
        Self::with_broker(memory.clone(), memory)
    }

    fn with_broker(broker: Arc<dyn JobBroker>, memory: Arc<MemoryBroker>) -> Self {
        let breakers = Arc::new(Breakers::from_config(&WorkerConfig::default()));
        let router = Arc::new(ProviderRouter::new(Arc::clone(&breakers), Provider::Anthropic));
        let diagnostics = Arc::new(RecordingDiagnostics::default());
        let ctx = WorkerContext::new(Arc::clone(&broker), router, diagnostics.clone());
        Self {
            broker,
            memory,
            breakers,
            diagnostics,
            ctx,
        }
    }

    fn worker(&self, queue: QueueName, handler: Arc<dyn JobHandler>) -> QueueWorker {
        self.worker_with(queue, QueueOptions::for_queue(queue), handler)
    }

    fn worker_with(
        &self,
        queue: QueueName,
        options: QueueOptions,
        handler: Arc<dyn JobHandler>,
    ) -> QueueWorker {
        QueueWorker::new(queue, options, self.ctx.clone(), handler)
            .unwrap()
            .with_fetch_block(Duration::from_millis(20))
    }

    async fn enqueue(&self, queue: QueueName, payload: Value, max_attempts: u32) -> JobId {
        self.memory
            .enqueue(
                queue,
                payload,
                EnqueueOptions::default().with_max_attempts(max_attempts),
            )
            .await
            .unwrap()
    }

    async fn lease(&self, queue: QueueName) -> Job {
        self.memory
            .fetch(queue, "test", 1, Duration::ZERO)
            .await
            .unwrap()
            .remove(0)
    }

    async fn counts(&self, queue: QueueName) -> JobCounts {
        self.memory.counts(queue).await.unwrap()
    }

    async fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.memory
            .peek(QueueName::DeadLetter, 100)
            .await
            .unwrap()
            .iter()
            .map(|job| DeadLetterRecord::from_dead_letter_job(job).unwrap())
            .collect()
    }
}

fn failing_handler(calls: Arc<AtomicU32>, error: fn() -> WorkerError) -> Arc<dyn JobHandler> {
    Arc::new(handler_fn(move |_ctx: JobContext| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Err(error()) }
    }))
}

async fn wait_until<F, Fut>(limit: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(limit, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached within {limit:?}");
}

#[tokio::test]
async fn test_email_job_with_one_attempt_is_dead_lettered() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let handle = harness
        .worker(
            QueueName::Email,
            failing_handler(calls.clone(), || WorkerError::provider("email", "smtp rejected")),
        )
        .spawn();

    let job_id = harness
        .enqueue(QueueName::Email, json!({"userId": "u1", "emailType": "welcome"}), 1)
        .await;

    let h = &harness;
    wait_until(Duration::from_secs(5), move || async move {
        h.counts(QueueName::DeadLetter).await.waiting == 1
    })
    .await;
    handle.shutdown().await.unwrap();

    let records = harness.dead_letters().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_queue, QueueName::Email);
    assert_eq!(records[0].original_job_id, job_id);
    assert_eq!(records[0].attempts_made, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let counts = harness.counts(QueueName::Email).await;
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn test_failure_is_redacted_before_leaving_the_worker() {
    let harness = Harness::new();
    let worker = harness.worker(
        QueueName::Email,
        failing_handler(Arc::new(AtomicU32::new(0)), || {
            WorkerError::job_failed("123-45-6789 invalid")
        }),
    );

    harness
        .enqueue(
            QueueName::Email,
            json!({"userId": "u1", "ssn": "123-45-6789", "documentId": "d1"}),
            1,
        )
        .await;
    worker.process(harness.lease(QueueName::Email).await).await;

    let records = harness.dead_letters().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].redacted_payload, json!({"userId": "u1", "documentId": "d1"}));
    assert!(records[0].redacted_error.ends_with("[SSN] invalid"));
    assert!(!records[0].redacted_error.contains("6789"));

    let reports = harness.diagnostics.reports();
    assert_eq!(reports.len(), 1);
    let (error, context) = &reports[0];
    assert!(error.ends_with("[SSN] invalid"));
    assert!(context.terminal);
    assert!(context.redacted_payload.get("ssn").is_none());
}

#[tokio::test]
async fn test_breaker_opens_after_threshold_and_fails_fast() {
    let harness = Harness::new();
    let calls = Arc::new(AtomicU32::new(0));
    let worker = harness.worker(
        QueueName::DocumentAnalysis,
        failing_handler(calls.clone(), || {
            WorkerError::provider("anthropic", "529 overloaded")
        }),
    );

    for _ in 0..6 {
        harness
            .enqueue(QueueName::DocumentAnalysis, json!({"documentId": "d1"}), 3)
            .await;
    }

    for _ in 0..5 {
        worker.process(harness.lease(QueueName::DocumentAnalysis).await).await;
    }
    let breaker = harness.breakers.get(Provider::Anthropic).unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    worker.process(harness.lease(QueueName::DocumentAnalysis).await).await;

    assert_eq!(calls.load(Ordering::SeqCst), 5);
    let reports = harness.diagnostics.reports();
    assert_eq!(reports.len(), 6);
    assert_eq!(reports[5].1.error_kind, "breaker_open");
    assert_eq!(reports[4].1.error_kind, "provider");

    // Other providers are unaffected.
    let openai = harness.breakers.get(Provider::OpenAi).unwrap();
    assert_eq!(openai.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_only_the_final_attempt_is_dead_lettered() {
    let harness = Harness::new();
    let worker = harness.worker(
        QueueName::FormAutofill,
        failing_handler(Arc::new(AtomicU32::new(0)), || {
            WorkerError::provider("openai", "502 bad gateway")
        }),
    );
    harness
        .enqueue(QueueName::FormAutofill, json!({"formId": "f1", "provider": "openai"}), 3)
        .await;

    for attempt in 1..=3u32 {
        let job = harness.lease(QueueName::FormAutofill).await;
        assert_eq!(job.attempts_made, attempt);
        worker.process(job).await;

        let expected = if attempt < 3 { 0 } else { 1 };
        assert_eq!(
            harness.counts(QueueName::DeadLetter).await.waiting,
            expected,
            "after attempt {attempt}"
        );
    }

    let counts = harness.counts(QueueName::FormAutofill).await;
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.failed, 1);
}

/// Delegates to the in-memory broker but refuses dead-letter writes.
struct BrokenDeadLetters(Arc<MemoryBroker>);

#[async_trait]
impl JobBroker for BrokenDeadLetters {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: Value,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        if queue == QueueName::DeadLetter {
            return Err(QueueError::enqueue_failed("dead-letter stream unavailable"));
        }
        self.0.enqueue(queue, payload, options).await
    }

    async fn fetch(
        &self,
        queue: QueueName,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Job>> {
        self.0.fetch(queue, consumer, count, block).await
    }

    async fn ack(&self, job: &Job) -> QueueResult<()> {
        self.0.ack(job).await
    }

    async fn fail(&self, job: &Job, error: &str) -> QueueResult<()> {
        self.0.fail(job, error).await
    }

    async fn reclaim_stalled(
        &self,
        queue: QueueName,
        consumer: &str,
        timing: &TimingProfile,
    ) -> QueueResult<StalledBatch> {
        self.0.reclaim_stalled(queue, consumer, timing).await
    }

    async fn report_progress(&self, job: &Job, progress: u8) -> QueueResult<()> {
        self.0.report_progress(job, progress).await
    }

    async fn counts(&self, queue: QueueName) -> QueueResult<JobCounts> {
        self.0.counts(queue).await
    }

    async fn peek(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<Job>> {
        self.0.peek(queue, limit).await
    }

    async fn remove(&self, queue: QueueName, id: &JobId) -> QueueResult<bool> {
        self.0.remove(queue, id).await
    }

    async fn close(&self) -> QueueResult<()> {
        self.0.close().await
    }
}

#[tokio::test]
async fn test_dead_letter_write_failure_does_not_break_failure_path() {
    let memory = Arc::new(MemoryBroker::new());
    let harness = Harness::with_broker(Arc::new(BrokenDeadLetters(memory.clone())), memory);
    let worker = harness.worker(
        QueueName::Completeness,
        failing_handler(Arc::new(AtomicU32::new(0)), || {
            WorkerError::provider("anthropic", "connection reset")
        }),
    );

    harness
        .enqueue(QueueName::Completeness, json!({"caseId": "c1"}), 1)
        .await;
    worker.process(harness.lease(QueueName::Completeness).await).await;

    // The failure was still reported and surfaced to the broker.
    assert_eq!(harness.diagnostics.reports().len(), 1);
    assert_eq!(harness.counts(QueueName::Completeness).await.failed, 1);
    assert_eq!(harness.counts(QueueName::DeadLetter).await.waiting, 0);

    // The worker keeps processing.
    let ok = harness.worker(
        QueueName::Completeness,
        Arc::new(handler_fn(|_ctx: JobContext| async { Ok(json!({})) })),
    );
    harness
        .enqueue(QueueName::Completeness, json!({"caseId": "c2"}), 1)
        .await;
    ok.process(harness.lease(QueueName::Completeness).await).await;
    assert_eq!(harness.counts(QueueName::Completeness).await.completed, 1);
    assert!(harness.broker.counts(QueueName::Completeness).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_drains_workers_before_closing_broker() {
    let harness = Harness::new();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
    let started_tx = Arc::new(Mutex::new(Some(started_tx)));

    let slow = Arc::new(handler_fn(move |_ctx: JobContext| {
        let started_tx = Arc::clone(&started_tx);
        async move {
            if let Some(tx) = started_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(json!({"done": true}))
        }
    }));
    let handle = harness.worker(QueueName::Recommendations, slow).spawn();
    harness
        .enqueue(QueueName::Recommendations, json!({"caseId": "c1"}), 3)
        .await;
    started_rx.await.unwrap();

    let lifecycle = LifecycleCoordinator::new();
    let completed_at_close = Arc::new(Mutex::new(None));

    // Registered first, but runs after the worker drain.
    {
        let broker = Arc::clone(&harness.broker);
        let completed_at_close = Arc::clone(&completed_at_close);
        lifecycle.register("broker", CleanupPhase::Connections, move || async move {
            let counts = broker.counts(QueueName::Recommendations).await?;
            *completed_at_close.lock().unwrap() = Some(counts.completed);
            broker.close().await?;
            Ok::<(), WorkerError>(())
        });
    }
    lifecycle.register("recommendations worker", CleanupPhase::Workers, move || {
        handle.shutdown()
    });

    let report = lifecycle.shutdown().await.unwrap();

    assert!(report.is_clean(), "{:?}", report.failed);
    assert_eq!(report.completed, vec!["recommendations worker", "broker"]);
    assert_eq!(*completed_at_close.lock().unwrap(), Some(1));
    assert!(lifecycle.shutdown().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_job_that_keeps_stalling_counts_as_failed_attempt() {
    let harness = Harness::new();
    let timing = TimingProfile {
        max_stalled_count: 0,
        ..TimingProfile::DELIVERY
    };
    let handle = harness
        .worker_with(
            QueueName::Email,
            QueueOptions::for_queue(QueueName::Email).with_timing(timing),
            Arc::new(handler_fn(|_ctx: JobContext| async { Ok(json!({})) })),
        )
        .spawn();

    // Leased by a consumer that never finishes it.
    harness
        .enqueue(QueueName::Email, json!({"userId": "u1"}), 1)
        .await;
    let abandoned = harness.lease(QueueName::Email).await;

    let h = &harness;
    wait_until(Duration::from_secs(300), move || async move {
        h.counts(QueueName::DeadLetter).await.waiting == 1
    })
    .await;
    handle.shutdown().await.unwrap();

    let records = harness.dead_letters().await;
    assert_eq!(records[0].original_job_id, abandoned.id);
    assert!(records[0].redacted_error.contains("stalled"));
    assert_eq!(harness.counts(QueueName::Email).await.failed, 1);
    assert_eq!(harness.diagnostics.reports()[0].1.error_kind, "stalled");
}

#[tokio::test(start_paused = true)]
async fn test_stalled_job_is_reclaimed_and_run_without_using_an_attempt() {
    let harness = Harness::new();
    harness
        .enqueue(QueueName::Email, json!({"userId": "u1"}), 3)
        .await;
    let abandoned = harness.lease(QueueName::Email).await;
    assert_eq!(abandoned.attempts_made, 1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        Arc::new(handler_fn(move |ctx: JobContext| {
            seen.lock()
                .unwrap()
                .push((ctx.job().id.clone(), ctx.job().attempts_made));
            async { Ok(json!({})) }
        }))
    };
    let handle = harness.worker(QueueName::Email, handler).spawn();

    let h = &harness;
    wait_until(Duration::from_secs(120), move || async move {
        h.counts(QueueName::Email).await.completed == 1
    })
    .await;
    handle.shutdown().await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![(abandoned.id, 1)]);
    let counts = harness.counts(QueueName::Email).await;
    assert_eq!(counts.active, 0);
    assert_eq!(counts.failed, 0);
    assert!(harness.diagnostics.reports().is_empty());
    assert!(harness.dead_letters().await.is_empty());
}
