//! Prometheus metrics for the HTTP surface.

use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use caseq_models::QueueName;
use caseq_queue::JobCounts;

/// Install the Prometheus recorder for the whole process.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "caseq_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "caseq_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "caseq_http_requests_in_flight";

    pub const QUEUE_JOBS: &str = "caseq_queue_jobs";
    pub const DEAD_LETTER_REPLAYS_TOTAL: &str = "caseq_dead_letter_replays_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Update the per-state job gauges of one queue.
pub fn set_queue_counts(queue: QueueName, counts: &JobCounts) {
    let states = [
        ("waiting", counts.waiting),
        ("active", counts.active),
        ("completed", counts.completed),
        ("failed", counts.failed),
        ("delayed", counts.delayed),
    ];
    for (state, value) in states {
        let labels = [("queue", queue.to_string()), ("state", state.to_string())];
        gauge!(names::QUEUE_JOBS, &labels).set(value as f64);
    }
}

/// Record a dead-letter record replayed onto its original queue.
pub fn record_dead_letter_replay(queue: QueueName) {
    let labels = [("queue", queue.to_string())];
    counter!(names::DEAD_LETTER_REPLAYS_TOTAL, &labels).increment(1);
}

/// Replace record ids in paths so labels stay bounded.
fn sanitize_path(path: &str) -> String {
    let mut previous = "";
    path.split('/')
        .map(|segment| {
            let out = if previous == "dead-letters" && !segment.is_empty() {
                ":id"
            } else {
                segment
            };
            previous = segment;
            out
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
    let response = next.run(request).await;
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    record_http_request(&method, &path, status, start.elapsed().as_secs_f64());

    response
}
