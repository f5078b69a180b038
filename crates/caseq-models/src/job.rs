//! Job definitions for queue processing.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::queue::QueueName;

/// Unique identifier for a job, assigned by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unit of work pulled from one named queue.
///
/// `attempts_made` and `max_attempts` are owned by the broker. The broker
/// counts a delivery as an attempt, so when a handler fails the value already
/// includes the failing attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Broker-assigned ID
    pub id: JobId,

    /// Queue this job was pulled from
    pub queue: QueueName,

    /// Queue-specific payload (a JSON object)
    pub payload: serde_json::Value,

    /// Attempts made so far, including the one in progress
    #[serde(default)]
    pub attempts_made: u32,

    /// Maximum attempts before the job is dead-lettered
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Request correlation ID propagated from the enqueuing request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// When the job was first enqueued
    pub enqueued_at: DateTime<Utc>,

    /// Broker-specific handle of the current delivery (e.g. a stream entry ID)
    #[serde(skip)]
    pub delivery_tag: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

impl Job {
    /// Create a job that has not been delivered yet.
    pub fn new(queue: QueueName, payload: serde_json::Value, max_attempts: u32) -> Self {
        Self {
            id: JobId::new(),
            queue,
            payload,
            attempts_made: 0,
            max_attempts,
            correlation_id: None,
            enqueued_at: Utc::now(),
            delivery_tag: None,
        }
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// True when a failure now would exhaust the job's attempts.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Attempts left after the current one.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_made)
    }

    /// Decode the payload into its typed form.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Read a top-level string field from the payload.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(|v| v.as_str())
    }
}
