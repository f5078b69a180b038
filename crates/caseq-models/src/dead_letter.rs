//! Dead-letter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};
use crate::queue::QueueName;

/// Persisted representation of a terminally-failed job.
///
/// Records are written once to the dead-letter queue and never mutated.
/// The payload and error are already redacted when the record is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_queue: QueueName,
    pub original_job_id: JobId,
    pub redacted_payload: serde_json::Value,
    pub redacted_error: String,
    pub failed_at: DateTime<Utc>,
    pub attempts_made: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl DeadLetterRecord {
    /// Decode a record from a job pulled off the dead-letter queue.
    pub fn from_dead_letter_job(job: &Job) -> Result<Self, serde_json::Error> {
        job.payload_as()
    }
}
