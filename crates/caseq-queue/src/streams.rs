//! Job broker using Redis Streams.
//!
//! One stream and one consumer group per queue. Entries carry the job as
//! JSON with the attempts made *before* the current delivery, so a stalled
//! redelivery does not consume an attempt while a surfaced failure does.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
    StreamReadReply,
};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use caseq_models::{Job, JobId, QueueName};

use crate::broker::{JobBroker, StalledBatch};
use crate::error::{QueueError, QueueResult};
use crate::options::{EnqueueOptions, JobCounts, TimingProfile};
use crate::progress::{ProgressChannel, ProgressEvent};

/// Entries scanned per XRANGE page when looking a job up by ID.
const SCAN_PAGE: usize = 200;

/// Upper bound on stalled entries handled per sweep.
const STALLED_BATCH: usize = 100;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every key and stream
    pub key_prefix: String,
    /// Consumer group name
    pub consumer_group: String,
    /// TTL of idempotency keys
    pub dedup_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "caseq".to_string(),
            consumer_group: "caseq:workers".to_string(),
            dedup_ttl: Duration::from_secs(3600), // 1 hour
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or_else(|_| "caseq".to_string()),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or_else(|_| "caseq:workers".to_string()),
            dedup_ttl: Duration::from_secs(
                std::env::var("QUEUE_DEDUP_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
        }
    }
}

/// Redis Streams broker.
pub struct RedisBroker {
    client: redis::Client,
    config: QueueConfig,
    progress: ProgressChannel,
    closed: AtomicBool,
}

impl RedisBroker {
    /// Create a new broker.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let progress = ProgressChannel::new(client.clone(), config.key_prefix.clone());
        Ok(Self {
            client,
            config,
            progress,
            closed: AtomicBool::new(false),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    fn stream_key(&self, queue: QueueName) -> String {
        format!("{}:{}", self.config.key_prefix, queue)
    }

    fn counter_key(&self, queue: QueueName, state: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, queue, state)
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    /// Create the consumer group of every queue (ignored if it exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        for queue in QueueName::ALL {
            let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(self.stream_key(queue))
                .arg(&self.config.consumer_group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match result {
                Ok(_) => info!("Created consumer group for queue {}", queue),
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!("Consumer group already exists for queue {}", queue);
                }
                Err(e) => return Err(QueueError::Redis(e)),
            }
        }

        Ok(())
    }

    /// Decode a stream entry. `delivered` bumps the attempt counter.
    fn decode_entry(entry: &StreamId, delivered: bool) -> QueueResult<Job> {
        let Some(redis::Value::BulkString(payload)) = entry.map.get("job") else {
            return Err(QueueError::Serialization(format!(
                "entry {} has no job field",
                entry.id
            )));
        };
        let mut job: Job = serde_json::from_slice(payload)?;
        if delivered {
            job.attempts_made += 1;
        }
        job.delivery_tag = Some(entry.id.clone());
        Ok(job)
    }

    /// Decode delivered entries, dropping malformed ones so they are not redelivered.
    async fn decode_delivered(&self, queue: QueueName, entries: Vec<StreamId>) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            match Self::decode_entry(&entry, true) {
                Ok(job) => jobs.push(job),
                Err(e) => {
                    warn!(queue = %queue, entry = %entry.id, "Failed to parse job payload: {}", e);
                    self.delete_entry(queue, &entry.id).await.ok();
                }
            }
        }
        jobs
    }

    async fn delete_entry(&self, queue: QueueName, entry_id: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        let stream = self.stream_key(queue);
        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&stream)
            .arg(entry_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// XADD command for a job, trimming entries older than `retention`.
    fn add_command(&self, job: &Job, retention: Option<Duration>) -> QueueResult<redis::Cmd> {
        let payload = serde_json::to_string(job)?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(job.queue));

        if let Some(retention) = retention {
            // Approximate trim of entries older than the retention window.
            let threshold = Utc::now().timestamp_millis() - retention.as_millis() as i64;
            cmd.arg("MINID").arg("~").arg(format!("{}-0", threshold.max(0)));
        }

        cmd.arg("*").arg("job").arg(payload);
        Ok(cmd)
    }

    async fn add_entry(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job: &Job,
        retention: Option<Duration>,
    ) -> QueueResult<String> {
        let entry_id: String = self.add_command(job, retention)?.query_async(conn).await?;
        Ok(entry_id)
    }

    /// Settle a failed delivery in one MULTI/EXEC: requeue the job (or count
    /// it as failed) and remove the delivered entry.
    fn fail_pipeline(&self, job: &Job, entry_id: &str) -> QueueResult<redis::Pipeline> {
        let stream = self.stream_key(job.queue);
        let mut pipe = redis::pipe();
        pipe.atomic();

        if job.attempts_made < job.max_attempts {
            // The stored count already includes this attempt.
            let mut retry = job.clone();
            retry.delivery_tag = None;
            pipe.add_command(self.add_command(&retry, None)?).ignore();
        } else {
            pipe.cmd("INCR")
                .arg(self.counter_key(job.queue, "failed"))
                .ignore();
        }

        pipe.cmd("XACK")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(entry_id)
            .ignore()
            .cmd("XDEL")
            .arg(&stream)
            .arg(entry_id)
            .ignore();
        Ok(pipe)
    }

    fn delivery_tag(job: &Job) -> QueueResult<&str> {
        job.delivery_tag
            .as_deref()
            .ok_or_else(|| QueueError::JobNotFound(job.id.to_string()))
    }
}

#[async_trait]
impl JobBroker for RedisBroker {
    async fn enqueue(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        let mut conn = self.connection().await?;

        if let Some(key) = &options.idempotency_key {
            let dedup_key = format!("{}:dedup:{}", self.config.key_prefix, key);
            let fresh: bool = redis::cmd("SET")
                .arg(&dedup_key)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(self.config.dedup_ttl.as_secs())
                .query_async::<Option<String>>(&mut conn)
                .await?
                .is_some();
            if !fresh {
                warn!("Duplicate job rejected: {}", key);
                return Err(QueueError::Duplicate(key.clone()));
            }
        }

        let job = Job::new(queue, payload, options.attempts_for(queue))
            .with_correlation_id(options.correlation_id.clone());
        let entry_id = self.add_entry(&mut conn, &job, options.retention).await?;

        info!(queue = %queue, job_id = %job.id, entry = %entry_id, "Enqueued job");
        Ok(job.id)
    }

    async fn fetch(
        &self,
        queue: QueueName,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<Job>> {
        let mut conn = self.connection().await?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count);
        if !block.is_zero() {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        let reply: Option<StreamReadReply> = cmd
            .arg("STREAMS")
            .arg(self.stream_key(queue))
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        let entries = reply
            .unwrap_or_default()
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .collect();
        let jobs = self.decode_delivered(queue, entries).await;

        if !jobs.is_empty() {
            debug!(queue = %queue, "Consumed {} jobs from stream", jobs.len());
        }
        Ok(jobs)
    }

    async fn ack(&self, job: &Job) -> QueueResult<()> {
        let entry_id = Self::delivery_tag(job)?;
        self.delete_entry(job.queue, entry_id).await?;

        let mut conn = self.connection().await?;
        conn.incr::<_, _, ()>(self.counter_key(job.queue, "completed"), 1)
            .await?;

        debug!("Acknowledged job: {}", job.id);
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> QueueResult<()> {
        let entry_id = Self::delivery_tag(job)?;
        let mut conn = self.connection().await?;

        // A retried call whose earlier EXEC went through finds the entry gone.
        let delivered: StreamRangeReply = redis::cmd("XRANGE")
            .arg(self.stream_key(job.queue))
            .arg(entry_id)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        if delivered.ids.is_empty() {
            debug!(job_id = %job.id, entry = %entry_id, "Failure already settled");
            return Ok(());
        }

        self.fail_pipeline(job, entry_id)?
            .query_async::<()>(&mut conn)
            .await?;

        debug!(
            job_id = %job.id,
            requeued = job.attempts_made < job.max_attempts,
            "Settled failed job (attempt {}/{}): {}",
            job.attempts_made, job.max_attempts, error
        );
        Ok(())
    }

    async fn reclaim_stalled(
        &self,
        queue: QueueName,
        consumer: &str,
        timing: &TimingProfile,
    ) -> QueueResult<StalledBatch> {
        let mut conn = self.connection().await?;
        let stream = self.stream_key(queue);
        let min_idle = timing.lock_duration.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle)
            .arg("-")
            .arg("+")
            .arg(STALLED_BATCH)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(StalledBatch::default());
        }

        // Every idle delivery is one stall.
        let exhausted_ids: HashSet<String> = pending
            .ids
            .iter()
            .filter(|p| p.times_delivered > timing.max_stalled_count as usize)
            .map(|p| p.id.clone())
            .collect();

        let mut claim = redis::cmd("XCLAIM");
        claim
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle);
        for p in &pending.ids {
            claim.arg(&p.id);
        }
        let claimed: StreamClaimReply = claim.query_async(&mut conn).await?;

        let mut batch = StalledBatch::default();
        for job in self.decode_delivered(queue, claimed.ids).await {
            let tag = job.delivery_tag.clone().unwrap_or_default();
            if exhausted_ids.contains(&tag) {
                batch.exhausted.push(job);
            } else {
                batch.reclaimed.push(job);
            }
        }

        if !batch.is_empty() {
            info!(
                queue = %queue,
                reclaimed = batch.reclaimed.len(),
                exhausted = batch.exhausted.len(),
                "Claimed stalled jobs"
            );
        }
        Ok(batch)
    }

    async fn report_progress(&self, job: &Job, progress: u8) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.progress
            .publish(&ProgressEvent {
                job_id: job.id.clone(),
                queue: job.queue,
                progress: progress.min(100),
            })
            .await
    }

    async fn counts(&self, queue: QueueName) -> QueueResult<JobCounts> {
        let mut conn = self.connection().await?;
        let stream = self.stream_key(queue);

        let len: u64 = conn.xlen(&stream).await?;
        let pending: StreamPendingReply = redis::cmd("XPENDING")
            .arg(&stream)
            .arg(&self.config.consumer_group)
            .query_async(&mut conn)
            .await?;
        let completed: Option<u64> = conn.get(self.counter_key(queue, "completed")).await?;
        let failed: Option<u64> = conn.get(self.counter_key(queue, "failed")).await?;

        let active = pending.count() as u64;
        Ok(JobCounts {
            waiting: len.saturating_sub(active),
            active,
            completed: completed.unwrap_or(0),
            failed: failed.unwrap_or(0),
            delayed: 0,
        })
    }

    async fn peek(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<Job>> {
        let mut conn = self.connection().await?;
        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(self.stream_key(queue))
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .ids
            .iter()
            .filter_map(|entry| Self::decode_entry(entry, false).ok())
            .collect())
    }

    async fn remove(&self, queue: QueueName, id: &JobId) -> QueueResult<bool> {
        let mut conn = self.connection().await?;
        let stream = self.stream_key(queue);
        let mut start = "-".to_string();

        loop {
            let page: StreamRangeReply = redis::cmd("XRANGE")
                .arg(&stream)
                .arg(&start)
                .arg("+")
                .arg("COUNT")
                .arg(SCAN_PAGE)
                .query_async(&mut conn)
                .await?;

            let Some(last) = page.ids.last() else {
                return Ok(false);
            };
            start = format!("({}", last.id);

            let found = page
                .ids
                .iter()
                .find(|entry| matches!(Self::decode_entry(entry, false), Ok(job) if &job.id == id));
            if let Some(entry) = found {
                let removed: u64 = conn.xdel(&stream, &[&entry.id]).await?;
                return Ok(removed > 0);
            }
            if page.ids.len() < SCAN_PAGE {
                return Ok(false);
            }
        }
    }

    async fn close(&self) -> QueueResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Redis broker closed");
        }
        Ok(())
    }
}
