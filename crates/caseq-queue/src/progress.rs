//! Progress events published over Redis Pub/Sub.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

use caseq_models::{JobId, QueueName};

use crate::error::QueueResult;

/// Progress event published to Redis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub queue: QueueName,
    /// Percent complete (0-100)
    pub progress: u8,
}

/// Publisher for progress events.
pub struct ProgressChannel {
    client: redis::Client,
    prefix: String,
}

impl ProgressChannel {
    /// Create a new progress channel.
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    /// Get the channel name for a queue.
    pub fn channel_name(&self, queue: QueueName) -> String {
        format!("{}:progress:{}", self.prefix, queue)
    }

    /// Publish a progress event.
    pub async fn publish(&self, event: &ProgressEvent) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = self.channel_name(event.queue);
        let payload = serde_json::to_string(event)?;

        debug!("Publishing progress event to {}", channel);
        conn.publish::<_, _, ()>(channel, payload).await?;

        Ok(())
    }
}
