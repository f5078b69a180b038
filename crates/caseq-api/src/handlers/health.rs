//! Health check handler.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use caseq_models::QueueName;
use caseq_queue::JobCounts;

use crate::metrics;
use crate::state::AppState;

/// Health response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub queues: BTreeMap<String, JobCounts>,
    /// Queues whose counts could not be read
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_queues: Vec<String>,
    #[serde(flatten)]
    pub components: BTreeMap<String, serde_json::Value>,
}

/// Per-queue job counts and process uptime.
///
/// Any failed count query makes the whole process unhealthy (503), since
/// it means the broker cannot be reached for that queue.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let mut queues = BTreeMap::new();
    let mut failed_queues = Vec::new();

    for queue in QueueName::ALL {
        match state.broker.counts(queue).await {
            Ok(counts) => {
                metrics::set_queue_counts(queue, &counts);
                queues.insert(queue.to_string(), counts);
            }
            Err(e) => {
                warn!(queue = %queue, "Health check count failed: {}", e);
                failed_queues.push(queue.to_string());
            }
        }
    }

    let components = state
        .probes
        .iter()
        .map(|probe| (probe.name().to_string(), probe.status()))
        .collect();

    let healthy = failed_queues.is_empty();
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
        queues,
        failed_queues,
        components,
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
