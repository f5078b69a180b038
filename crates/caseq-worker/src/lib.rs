//! Background job worker.
//!
//! This crate provides:
//! - One concurrency-bounded consumer loop per queue
//! - Per-provider circuit breakers and per-job provider routing
//! - PII scrubbing and the payload allowlist applied to every failure
//! - Dead-letter forwarding of terminally failed jobs
//! - Phased, run-once graceful shutdown

pub mod circuit_breaker;
pub mod config;
pub mod dead_letter;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod failure;
pub mod handler;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod redact;
pub mod retry;
pub mod routing;
pub mod worker;

pub use circuit_breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use config::WorkerConfig;
pub use dead_letter::{DeadLetterForwarder, ForwardOutcome};
pub use diagnostics::{DiagnosticsSink, FailureContext, TracingDiagnostics};
pub use dispatch::HttpDispatchHandler;
pub use error::{WorkerError, WorkerResult};
pub use failure::{FailureReport, FailureReporter};
pub use handler::{handler_fn, JobContext, JobHandler};
pub use lifecycle::{CleanupPhase, LifecycleCoordinator, LifecycleState, ShutdownReport};
pub use logging::JobLogger;
pub use redact::{filter_payload, scrub, scrub_value, PAYLOAD_ALLOWLIST};
pub use routing::{Breakers, CallPolicy, ProviderRouter};
pub use worker::{QueueWorker, WorkerContext, WorkerHandle};
