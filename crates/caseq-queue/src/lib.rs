//! Queue broker for the caseq job core.
//!
//! This crate provides:
//! - The `JobBroker` interface the worker consumes
//! - Per-queue timing profiles and enqueue options
//! - A Redis Streams backend with stalled-job recovery
//! - An in-memory backend for tests and local runs
//! - Progress events via Redis Pub/Sub

pub mod broker;
pub mod error;
pub mod memory;
pub mod options;
pub mod progress;
pub mod streams;

pub use broker::{enqueue_payload, JobBroker, StalledBatch};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryBroker;
pub use options::{EnqueueOptions, JobCounts, QueueOptions, TimingProfile, DEAD_LETTER_RETENTION};
pub use progress::{ProgressChannel, ProgressEvent};
pub use streams::{QueueConfig, RedisBroker};
