//! HTTP surface of the caseq job core.
//!
//! This crate provides:
//! - `/health` with per-queue job counts and process uptime
//! - Admin endpoints for queue counts and dead-letter replay, gated by a
//!   shared token and not mounted at all when no token is configured
//! - Prometheus metrics at `/metrics`

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::{AppState, HealthProbe};
