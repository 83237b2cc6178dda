//! Durable job records.
//!
//! The store is the single source of truth for job state. Every mutation goes
//! through [`JobStore::save`], a compare-and-swap on the record's `revision`,
//! so two writers racing on the same job cannot both win.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

use std::path::Path;

use im2_core::{
    ExpectedRevision, FencingToken, Job, JobId, JobState, OwnerId, JOB_SCHEMA_VERSION,
};

/// Job store abstraction.
pub trait JobStore: Send + Sync {
    /// Insert `job` unless a record for the same `source_reference` exists.
    ///
    /// Atomic with respect to concurrent callers: at most one insert wins.
    fn insert_if_absent(&self, job: Job) -> Result<InsertOutcome, StoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    fn find_by_source(&self, source: &Path) -> Result<Option<Job>, StoreError>;

    /// Jobs matching `filter`, oldest first (creation time, then detection order).
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Persist `job` if the stored revision matches `expected`; bumps `job`'s revision.
    fn save(&self, job: &mut Job, expected: ExpectedRevision) -> Result<(), StoreError>;

    /// Remove the record entirely (right-to-delete).
    fn purge(&self, job_id: JobId) -> Result<(), StoreError>;

    /// Highest fencing token ever bound to any job.
    fn max_fence(&self) -> Result<FencingToken, StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("revision conflict: {0}")]
    Conflict(String),
    #[error("job {job_id} has schema version {found}, this build supports up to {supported}")]
    SchemaTooNew {
        job_id: JobId,
        found: u32,
        supported: u32,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of [`JobStore::insert_if_absent`].
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Inserted(Job),
    /// A job already owns the source artifact.
    Existing(Job),
}

impl InsertOutcome {
    pub fn job(&self) -> &Job {
        match self {
            InsertOutcome::Inserted(j) | InsertOutcome::Existing(j) => j,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            InsertOutcome::Inserted(j) | InsertOutcome::Existing(j) => j,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }
}

/// Listing filter; empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner: Option<OwnerId>,
    pub states: Vec<JobState>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_state(state: JobState) -> Self {
        Self {
            states: vec![state],
            ..Self::default()
        }
    }

    pub fn in_states(states: impl IntoIterator<Item = JobState>) -> Self {
        Self {
            states: states.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn owned_by(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.owner.as_ref().is_none_or(|o| job.owner_id() == o)
            && (self.states.is_empty() || self.states.contains(&job.state()))
    }
}

/// Reject records written by a newer build.
pub(crate) fn ensure_supported(job: Job) -> Result<Job, StoreError> {
    if job.schema_version() > JOB_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            job_id: job.job_id(),
            found: job.schema_version(),
            supported: JOB_SCHEMA_VERSION,
        });
    }
    Ok(job)
}

/// Ordering used by every listing: creation time, then detection order.
pub(crate) fn listing_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    a.created_at()
        .cmp(&b.created_at())
        .then(a.detection_seq().cmp(&b.detection_seq()))
        .then(a.job_id().cmp(&b.job_id()))
}

impl<S> JobStore for std::sync::Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert_if_absent(&self, job: Job) -> Result<InsertOutcome, StoreError> {
        (**self).insert_if_absent(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(job_id)
    }

    fn find_by_source(&self, source: &Path) -> Result<Option<Job>, StoreError> {
        (**self).find_by_source(source)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        (**self).list(filter)
    }

    fn save(&self, job: &mut Job, expected: ExpectedRevision) -> Result<(), StoreError> {
        (**self).save(job, expected)
    }

    fn purge(&self, job_id: JobId) -> Result<(), StoreError> {
        (**self).purge(job_id)
    }

    fn max_fence(&self) -> Result<FencingToken, StoreError> {
        (**self).max_fence()
    }
}
