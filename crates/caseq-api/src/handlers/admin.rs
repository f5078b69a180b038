//! Admin handlers: queue counts and dead-letter inspection/replay.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use caseq_models::{DeadLetterRecord, JobId, QueueName};
use caseq_queue::{EnqueueOptions, JobCounts};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

/// Default number of dead-letter records listed.
const DEFAULT_LIST_LIMIT: usize = 50;
/// Upper bound for `limit` and for the replay lookup.
const MAX_LIST_LIMIT: usize = 500;

/// Queue counts response.
#[derive(Serialize)]
pub struct QueuesResponse {
    pub queues: BTreeMap<String, JobCounts>,
}

/// Counts for every queue, including the dead-letter queue.
pub async fn list_queues(State(state): State<AppState>) -> ApiResult<Json<QueuesResponse>> {
    let mut queues = BTreeMap::new();
    for queue in QueueName::ALL {
        queues.insert(queue.to_string(), state.broker.counts(queue).await?);
    }
    Ok(Json(QueuesResponse { queues }))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

/// One dead-letter record with the id needed to replay it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: JobId,
    #[serde(flatten)]
    pub record: DeadLetterRecord,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLettersResponse {
    pub dead_letters: Vec<DeadLetterEntry>,
    pub count: usize,
}

async fn recent_dead_letters(state: &AppState, limit: usize) -> ApiResult<Vec<DeadLetterEntry>> {
    let jobs = state.broker.peek(QueueName::DeadLetter, limit).await?;

    Ok(jobs
        .into_iter()
        .filter_map(|job| match DeadLetterRecord::from_dead_letter_job(&job) {
            Ok(record) => Some(DeadLetterEntry { id: job.id, record }),
            Err(e) => {
                warn!(job_id = %job.id, "Skipping undecodable dead-letter record: {}", e);
                None
            }
        })
        .collect())
}

/// Most recent dead-letter records, newest first.
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<DeadLettersResponse>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let dead_letters = recent_dead_letters(&state, limit).await?;
    Ok(Json(DeadLettersResponse {
        count: dead_letters.len(),
        dead_letters,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResponse {
    pub replayed_job_id: JobId,
    pub queue: QueueName,
}

/// Re-enqueue a record's redacted payload on its original queue with a
/// fresh attempt budget, then delete the record.
pub async fn replay_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ReplayResponse>> {
    let id = JobId::from_string(id);
    let entry = recent_dead_letters(&state, MAX_LIST_LIMIT)
        .await?
        .into_iter()
        .find(|entry| entry.id == id)
        .ok_or_else(|| ApiError::not_found(format!("dead-letter record {id}")))?;

    let queue = entry.record.original_queue;
    if queue == QueueName::DeadLetter {
        return Err(ApiError::bad_request("record points back at the dead-letter queue"));
    }

    let mut options = EnqueueOptions::for_queue(queue);
    if let Some(correlation_id) = entry.record.correlation_id {
        options = options.with_correlation_id(correlation_id);
    }

    let replayed_job_id = state
        .broker
        .enqueue(queue, entry.record.redacted_payload, options)
        .await?;

    if !state.broker.remove(QueueName::DeadLetter, &id).await? {
        warn!(record_id = %id, "Dead-letter record vanished before removal");
    }

    metrics::record_dead_letter_replay(queue);
    info!(
        record_id = %id,
        original_job_id = %entry.record.original_job_id,
        replayed_job_id = %replayed_job_id,
        queue = %queue,
        "Replayed dead-letter record"
    );

    Ok(Json(ReplayResponse {
        replayed_job_id,
        queue,
    }))
}
