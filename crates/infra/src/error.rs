use im2_core::{DomainError, ErrorKind, JobId};

use crate::config::ConfigError;
use crate::detector::DetectorError;
use crate::handoff::HandoffError;
use crate::locks::LockError;
use crate::store::StoreError;

/// Error surfaced by the router, sweeper and admin interface.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Handoff(#[from] HandoffError),
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),
}

impl OrchestratorError {
    /// Taxonomy bucket, as reported to callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Domain(e) => e.kind(),
            OrchestratorError::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            OrchestratorError::Store(StoreError::NotFound(_)) | OrchestratorError::NotFound(_) => {
                ErrorKind::Validation
            }
            OrchestratorError::Store(StoreError::SchemaTooNew { .. }) => ErrorKind::Validation,
            OrchestratorError::Lock(LockError::Lost { .. }) => ErrorKind::Conflict,
            OrchestratorError::Lock(LockError::Timeout(_)) => ErrorKind::Timeout,
            OrchestratorError::Config(_) => ErrorKind::Validation,
            _ => ErrorKind::Transient,
        }
    }

    /// Whether a stale writer lost a race (fence or revision).
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
