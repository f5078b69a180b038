//! Queue options, timing profiles and per-state counts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use caseq_models::{QueueName, WorkloadClass};

use crate::error::{QueueError, QueueResult};

/// How long dead-letter records are kept before the broker may expire them.
pub const DEAD_LETTER_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Lock and stall-detection timings for one class of queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingProfile {
    /// How long a worker may hold a job before the broker treats it as stalled
    pub lock_duration: Duration,
    /// How often stalled jobs are checked for
    pub stalled_interval: Duration,
    /// How many times a job may stall before it counts as a failed attempt
    pub max_stalled_count: u32,
}

impl TimingProfile {
    /// AI-bound handlers may legitimately run for ~2 minutes.
    pub const AI_BOUND: TimingProfile = TimingProfile {
        lock_duration: Duration::from_millis(150_000),
        stalled_interval: Duration::from_millis(120_000),
        max_stalled_count: 1,
    };

    /// Delivery handlers finish quickly, so stalls are detected sooner.
    pub const DELIVERY: TimingProfile = TimingProfile {
        lock_duration: Duration::from_millis(30_000),
        stalled_interval: Duration::from_millis(30_000),
        max_stalled_count: 2,
    };

    pub fn for_class(class: WorkloadClass) -> Self {
        match class {
            WorkloadClass::AiBound => Self::AI_BOUND,
            WorkloadClass::Delivery => Self::DELIVERY,
        }
    }
}

/// Consumer-side options for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Maximum concurrently executing jobs
    pub concurrency: usize,
    /// Lock/stall timings
    pub timing: TimingProfile,
    /// Internal timeout applied to each handler invocation
    pub handler_timeout: Duration,
}

impl QueueOptions {
    /// Default options for a queue, derived from its workload class.
    pub fn for_queue(queue: QueueName) -> Self {
        let (concurrency, handler_timeout) = match queue {
            QueueName::DocumentAnalysis => (3, Duration::from_secs(120)),
            QueueName::FormAutofill
            | QueueName::Recommendations
            | QueueName::Completeness
            | QueueName::SuccessScore => (2, Duration::from_secs(120)),
            QueueName::Email => (5, Duration::from_secs(15)),
            QueueName::DeadLetter => (1, Duration::from_secs(15)),
        };

        Self {
            concurrency,
            timing: TimingProfile::for_class(queue.workload_class()),
            handler_timeout,
        }
    }

    /// Set the concurrency limit.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the handler timeout.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Set the timing profile.
    pub fn with_timing(mut self, timing: TimingProfile) -> Self {
        self.timing = timing;
        self
    }

    /// Check that a still-running handler can never be redelivered.
    ///
    /// The lock must outlive the handler timeout, otherwise the broker
    /// hands a job that is still executing to another worker.
    pub fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::invalid_options("concurrency must be at least 1"));
        }
        if self.timing.lock_duration <= self.handler_timeout {
            return Err(QueueError::invalid_options(format!(
                "lock duration {:?} must exceed handler timeout {:?}",
                self.timing.lock_duration, self.handler_timeout
            )));
        }
        Ok(())
    }
}

/// Producer-side options for a single enqueue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Attempts before the job is dead-lettered (0 means the queue default)
    pub max_attempts: u32,
    /// Age after which finished entries may be expired by the broker
    pub retention: Option<Duration>,
    /// Correlation ID of the request that enqueued the job
    pub correlation_id: Option<String>,
    /// Reject the enqueue if a job with this key was enqueued recently
    pub idempotency_key: Option<String>,
}

impl EnqueueOptions {
    /// Options with the queue's default attempt budget.
    pub fn for_queue(queue: QueueName) -> Self {
        Self {
            max_attempts: Self::default_attempts(queue),
            ..Default::default()
        }
    }

    /// Options for a dead-letter record: one attempt, fixed retention.
    pub fn dead_letter() -> Self {
        Self {
            max_attempts: 1,
            retention: Some(DEAD_LETTER_RETENTION),
            ..Default::default()
        }
    }

    pub fn default_attempts(queue: QueueName) -> u32 {
        match queue {
            QueueName::Email => 5,
            QueueName::DeadLetter => 1,
            _ => 3,
        }
    }

    /// Attempt budget, falling back to the queue default.
    pub fn attempts_for(&self, queue: QueueName) -> u32 {
        if self.max_attempts == 0 {
            Self::default_attempts(queue)
        } else {
            self.max_attempts
        }
    }

    /// Set the max attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Job counts for one queue, by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profiles_keep_lock_above_handler_timeout() {
        for queue in QueueName::ALL {
            let options = QueueOptions::for_queue(queue);
            assert!(options.validate().is_ok(), "{queue} has invalid defaults");
        }
    }

    #[test]
    fn test_profile_by_class() {
        let ai = QueueOptions::for_queue(QueueName::DocumentAnalysis).timing;
        assert_eq!(ai.lock_duration, Duration::from_secs(150));
        assert_eq!(ai.stalled_interval, Duration::from_secs(120));
        assert_eq!(ai.max_stalled_count, 1);

        let email = QueueOptions::for_queue(QueueName::Email).timing;
        assert_eq!(email.lock_duration, Duration::from_secs(30));
        assert_eq!(email.stalled_interval, Duration::from_secs(30));
        assert_eq!(email.max_stalled_count, 2);
    }

    #[test]
    fn test_validate_rejects_short_lock() {
        let options = QueueOptions::for_queue(QueueName::Email)
            .with_handler_timeout(Duration::from_secs(30));
        assert!(matches!(options.validate(), Err(QueueError::InvalidOptions(_))));

        let options = QueueOptions::for_queue(QueueName::Email).with_concurrency(0);
        tokio_test::assert_err!(options.validate());
    }

    #[test]
    fn test_enqueue_attempt_defaults() {
        assert_eq!(EnqueueOptions::default().attempts_for(QueueName::Email), 5);
        assert_eq!(EnqueueOptions::default().attempts_for(QueueName::Completeness), 3);
        assert_eq!(
            EnqueueOptions::default().with_max_attempts(1).attempts_for(QueueName::Email),
            1
        );
        assert_eq!(EnqueueOptions::dead_letter().retention, Some(DEAD_LETTER_RETENTION));
    }
}
