//! API routes.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

use crate::auth::require_admin;
use crate::handlers::admin::{list_dead_letters, list_queues, replay_dead_letter};
use crate::handlers::health;
use crate::metrics::metrics_middleware;
use crate::middleware::{request_id, request_logging};
use crate::state::AppState;

/// Create the API router.
///
/// Admin routes are only mounted when an admin token is configured; without
/// one they return 404 like any unknown path.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health));

    let admin_routes = if state.config.admin_enabled() {
        info!("Admin endpoints enabled");
        Router::new()
            .route("/admin/queues", get(list_queues))
            .route("/admin/dead-letters", get(list_dead_letters))
            .route("/admin/dead-letters/:id/replay", post(replay_dead_letter))
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin))
    } else {
        warn!("ADMIN_TOKEN not set, admin endpoints disabled");
        Router::new()
    };

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .merge(health_routes)
        .merge(admin_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .with_state(state)
}
