//! HTTP dispatch handler.
//!
//! The worker binary does not embed job logic. Each job is POSTed to the
//! application's handler service at `{base_url}/{queue}` and the response
//! status decides the outcome.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

use caseq_models::QueueName;

use crate::error::{WorkerError, WorkerResult};
use crate::handler::{JobContext, JobHandler};

/// Header carrying the shared secret.
pub const SECRET_HEADER: &str = "x-worker-secret";
/// Header carrying the correlation ID of the request that enqueued the job.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Maximum characters of an error response kept in the failure message.
const MAX_ERROR_BODY: usize = 500;

pub struct HttpDispatchHandler {
    client: reqwest::Client,
    endpoint: String,
    secret: Option<String>,
}

impl HttpDispatchHandler {
    pub fn new(
        base_url: &str,
        queue: QueueName,
        secret: Option<String>,
        timeout: Duration,
    ) -> WorkerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::config_error(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/{}", base_url.trim_end_matches('/'), queue),
            secret,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Map a non-success status to an error.
///
/// Client errors mean the handler rejected the job itself and say nothing
/// about provider health; timeouts, throttling and server errors do.
fn status_error(status: StatusCode, provider: &str, body: &str) -> WorkerError {
    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
    let message = format!("handler returned {status}: {body}");

    if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        WorkerError::invalid_payload(message)
    } else {
        WorkerError::provider(provider, message)
    }
}

#[async_trait]
impl JobHandler for HttpDispatchHandler {
    async fn handle(&self, ctx: JobContext) -> WorkerResult<serde_json::Value> {
        let job = ctx.job();
        let provider = ctx.provider().map(|p| p.as_str()).unwrap_or("auto");

        let body = json!({
            "jobId": job.id,
            "queue": job.queue,
            "attemptsMade": job.attempts_made,
            "maxAttempts": job.max_attempts,
            "correlationId": job.correlation_id,
            "provider": ctx.provider(),
            "payload": job.payload,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(secret) = &self.secret {
            request = request.header(SECRET_HEADER, secret);
        }
        if let Some(correlation_id) = &job.correlation_id {
            request = request.header(CORRELATION_HEADER, correlation_id);
        }

        debug!(endpoint = %self.endpoint, job_id = %job.id, "Dispatching job");
        let response = request
            .send()
            .await
            .map_err(|e| WorkerError::provider(provider, format!("dispatch failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, provider, &text));
        }

        ctx.report_progress(100).await;

        let text = response
            .text()
            .await
            .map_err(|e| WorkerError::provider(provider, format!("reading response: {e}")))?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_queue() {
        let handler = HttpDispatchHandler::new(
            "http://localhost:3000/internal/jobs/",
            QueueName::SuccessScore,
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(handler.endpoint(), "http://localhost:3000/internal/jobs/success-score");
    }

    #[test]
    fn test_status_classification() {
        let rejected = status_error(StatusCode::UNPROCESSABLE_ENTITY, "anthropic", "missing caseId");
        assert!(matches!(rejected, WorkerError::InvalidPayload(_)));
        assert!(!rejected.counts_against_provider());

        let throttled = status_error(StatusCode::TOO_MANY_REQUESTS, "openai", "slow down");
        assert!(throttled.counts_against_provider());

        let outage = status_error(StatusCode::BAD_GATEWAY, "anthropic", "upstream error");
        assert!(outage.counts_against_provider());
        assert!(outage.to_string().contains("502"));
    }

    #[test]
    fn test_error_body_is_truncated() {
        let body = "x".repeat(2000);
        let err = status_error(StatusCode::INTERNAL_SERVER_ERROR, "email", &body);
        assert!(err.to_string().len() < 700);
    }
}
