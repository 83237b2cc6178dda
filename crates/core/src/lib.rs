//! `im2-core`: job orchestration domain building blocks.
//!
//! This crate contains **pure domain** primitives (no IO): identifiers, the
//! error taxonomy, the stage state machine and the durable job record.

pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod state;

pub use error::{DomainError, DomainResult, ErrorKind, JobError};
pub use id::{FencingToken, JobId, OwnerId, TraceId, WorkerId};
pub use job::{
    ActiveAttempt, Classification, ExpectedRevision, FailureDisposition, HistoryEntry, HistoryEvent, Job,
    OutputReference, JOB_SCHEMA_VERSION,
};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use state::{Actor, JobState, Stage};
