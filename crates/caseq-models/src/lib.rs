//! Shared data models for the caseq background job core.
//!
//! This crate provides Serde-serializable types for:
//! - Jobs and their retry bookkeeping
//! - Dead-letter records
//! - The fixed set of named queues
//! - Queue-specific payloads
//! - External providers a job may be routed through

pub mod dead_letter;
pub mod job;
pub mod payload;
pub mod provider;
pub mod queue;

// Re-export common types
pub use dead_letter::DeadLetterRecord;
pub use job::{Job, JobId};
pub use payload::{
    CaseInsightPayload, DocumentAnalysisPayload, EmailPayload, FormAutofillPayload, JobPayload,
};
pub use provider::{Provider, ProviderPreference};
pub use queue::{QueueName, UnknownQueue, WorkloadClass};
