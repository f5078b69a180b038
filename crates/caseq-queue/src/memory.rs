//! In-process broker for tests and local runs.
//!
//! Same delivery semantics as the Redis backend (attempt counting on
//! delivery, stalled-job recovery, retry on failure, idempotency keys that
//! expire after a TTL) without persistence. Retention is not enforced.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use caseq_models::{Job, JobId, QueueName};

use crate::broker::{JobBroker, StalledBatch};
use crate::error::{QueueError, QueueResult};
use crate::options::{EnqueueOptions, JobCounts, TimingProfile};

struct Lease {
    job: Job,
    leased_at: Instant,
    stalls: u32,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<Job>,
    active: HashMap<JobId, Lease>,
    completed: u64,
    failed: u64,
}

/// Default lifetime of an idempotency key, matching the Redis backend.
const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(3600);

/// Broker backed by process memory.
pub struct MemoryBroker {
    queues: Mutex<HashMap<QueueName, QueueState>>,
    /// Idempotency key -> when it was first seen
    seen_keys: Mutex<HashMap<String, Instant>>,
    dedup_ttl: Duration,
    progress: Mutex<HashMap<JobId, u8>>,
    notify: Notify,
    closed: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            seen_keys: Mutex::new(HashMap::new()),
            dedup_ttl: DEFAULT_DEDUP_TTL,
            progress: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    /// Record an idempotency key. Returns false if it was seen within the TTL.
    async fn claim_key(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen_keys.lock().await;
        seen.retain(|_, first_seen| now.duration_since(*first_seen) < self.dedup_ttl);

        if seen.contains_key(key) {
            return false;
        }
        seen.insert(key.to_string(), now);
        true
    }

    /// Last progress value reported for a job.
    pub async fn progress_of(&self, id: &JobId) -> Option<u8> {
        self.progress.lock().await.get(id).copied()
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    async fn take_waiting(&self, queue: QueueName, count: usize) -> Vec<Job> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue).or_default();
        let mut leased = Vec::new();

        while leased.len() < count {
            let Some(mut job) = state.waiting.pop_front() else {
                break;
            };
            job.attempts_made += 1;
            job.delivery_tag = Some(job.id.to_string());
            state.active.insert(
                job.id.clone(),
                Lease {
                    job: job.clone(),
                    leased_at: Instant::now(),
                    stalls: 0,
                },
            );
            leased.push(job);
        }

        leased
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        self.ensure_open()?;

        if let Some(key) = &options.idempotency_key {
            if !self.claim_key(key).await {
                return Err(QueueError::Duplicate(key.clone()));
            }
        }

        let job = Job::new(queue, payload, options.attempts_for(queue))
            .with_correlation_id(options.correlation_id);
        let id = job.id.clone();

        self.queues
            .lock()
            .await
            .entry(queue)
            .or_default()
            .waiting
            .push_back(job);
        self.notify.notify_waiters();

        debug!(queue = %queue, job_id = %id, "Enqueued job in memory");
        Ok(id)
    }

    async fn fetch(
        &self,
        queue: QueueName,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Job>> {
        let deadline = Instant::now() + block;

        loop {
            self.ensure_open()?;

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let jobs = self.take_waiting(queue, count).await;
            if !jobs.is_empty() {
                return Ok(jobs);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, job: &Job) -> QueueResult<()> {
        self.ensure_open()?;
        let mut queues = self.queues.lock().await;
        let state = queues.entry(job.queue).or_default();

        if state.active.remove(&job.id).is_none() {
            return Err(QueueError::JobNotFound(job.id.to_string()));
        }
        state.completed += 1;
        drop(queues);

        self.progress.lock().await.remove(&job.id);
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> QueueResult<()> {
        self.ensure_open()?;
        let mut queues = self.queues.lock().await;
        let state = queues.entry(job.queue).or_default();

        let Some(lease) = state.active.remove(&job.id) else {
            return Err(QueueError::JobNotFound(job.id.to_string()));
        };
        self.progress.lock().await.remove(&job.id);

        if lease.job.attempts_made < lease.job.max_attempts {
            debug!(job_id = %job.id, error, "Requeueing failed job");
            let mut retry = lease.job;
            retry.delivery_tag = None;
            state.waiting.push_back(retry);
            drop(queues);
            self.notify.notify_waiters();
        } else {
            state.failed += 1;
        }
        Ok(())
    }

    async fn reclaim_stalled(
        &self,
        queue: QueueName,
        _consumer: &str,
        timing: &TimingProfile,
    ) -> QueueResult<StalledBatch> {
        self.ensure_open()?;
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue).or_default();
        let mut batch = StalledBatch::default();
        let now = Instant::now();

        for lease in state.active.values_mut() {
            if now.duration_since(lease.leased_at) < timing.lock_duration {
                continue;
            }
            lease.stalls += 1;
            lease.leased_at = now;
            if lease.stalls > timing.max_stalled_count {
                batch.exhausted.push(lease.job.clone());
            } else {
                batch.reclaimed.push(lease.job.clone());
            }
        }

        Ok(batch)
    }

    async fn report_progress(&self, job: &Job, progress: u8) -> QueueResult<()> {
        self.ensure_open()?;
        self.progress.lock().await.insert(job.id.clone(), progress.min(100));
        Ok(())
    }

    async fn counts(&self, queue: QueueName) -> QueueResult<JobCounts> {
        self.ensure_open()?;
        let queues = self.queues.lock().await;
        Ok(queues
            .get(&queue)
            .map(|state| JobCounts {
                waiting: state.waiting.len() as u64,
                active: state.active.len() as u64,
                completed: state.completed,
                failed: state.failed,
                delayed: 0,
            })
            .unwrap_or_default())
    }

    async fn peek(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<Job>> {
        self.ensure_open()?;
        let queues = self.queues.lock().await;
        Ok(queues
            .get(&queue)
            .map(|state| state.waiting.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, queue: QueueName, id: &JobId) -> QueueResult<bool> {
        self.ensure_open()?;
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue).or_default();
        let before = state.waiting.len();
        state.waiting.retain(|job| &job.id != id);
        Ok(state.waiting.len() != before)
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}
