//! Domain error model and the job failure taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::JobId;
use crate::state::JobState;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Classification of a failure, recorded on the job and in its history.
///
/// Only `Transient` (and `Timeout` while attempts remain) is retried
/// automatically; everything else needs operator action.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Timeouts, temporary resource exhaustion.
    Transient,
    /// Malformed or contract-violating input.
    Validation,
    /// Registration collision; resolved by returning the existing job.
    DuplicateJob,
    /// Stale fencing token presented at commit.
    Conflict,
    /// Stage exceeded its hard limit (or its holder went silent).
    Timeout,
}

impl ErrorKind {
    /// Whether a failure of this kind may be retried without an operator.
    pub fn is_auto_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::DuplicateJob => "duplicate_job",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure as stored on the job (`last_error`) and in `stage_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

impl core::fmt::Display for JobError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Domain-level error.
///
/// Deterministic failures of the state machine and job record. Storage and
/// lock failures live in the infrastructure crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The state machine has no such edge (or not for this actor).
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },

    /// The edge exists but its precondition is not met.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Retry refused because the stage's attempt ceiling was reached.
    #[error("retry ceiling reached for {state} ({attempts} attempts)")]
    RetryCeilingReached { state: JobState, attempts: u32 },

    /// A stale fencing token or revision was presented.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The job does not exist.
    #[error("job not found: {0}")]
    NotFound(JobId),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Conflict(_) => ErrorKind::Conflict,
            DomainError::IllegalTransition { .. }
            | DomainError::PreconditionFailed(_)
            | DomainError::Validation(_)
            | DomainError::RetryCeilingReached { .. }
            | DomainError::NotFound(_) => ErrorKind::Validation,
        }
    }
}
