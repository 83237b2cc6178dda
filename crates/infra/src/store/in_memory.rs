//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use im2_core::{ExpectedRevision, FencingToken, Job, JobId};

use super::{InsertOutcome, JobFilter, JobStore, StoreError, ensure_supported, listing_order};

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    by_source: HashMap<PathBuf, JobId>,
}

/// In-memory job store.
///
/// Both maps live behind one lock so the source-uniqueness check and the
/// insert are a single atomic step.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Load records (e.g. from a checkpoint) as-is.
    pub fn seed(&self, jobs: impl IntoIterator<Item = Job>) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        for job in jobs {
            let job = ensure_supported(job)?;
            inner
                .by_source
                .insert(job.source_reference().to_path_buf(), job.job_id());
            inner.jobs.insert(job.job_id(), job);
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Storage("job store lock poisoned".into()))
    }
}

impl JobStore for InMemoryJobStore {
    fn insert_if_absent(&self, mut job: Job) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.write()?;

        if let Some(existing) = inner
            .by_source
            .get(job.source_reference())
            .and_then(|id| inner.jobs.get(id))
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        if inner.jobs.contains_key(&job.job_id()) {
            return Err(StoreError::Conflict(format!(
                "job id {} already in use",
                job.job_id()
            )));
        }

        job.set_revision(1);
        inner
            .by_source
            .insert(job.source_reference().to_path_buf(), job.job_id());
        inner.jobs.insert(job.job_id(), job.clone());
        Ok(InsertOutcome::Inserted(job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn find_by_source(&self, source: &Path) -> Result<Option<Job>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .by_source
            .get(source)
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let inner = self.read()?;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(listing_order);

        let jobs = jobs.into_iter().skip(filter.offset);
        Ok(match filter.limit {
            Some(limit) => jobs.take(limit).collect(),
            None => jobs.collect(),
        })
    }

    fn save(&self, job: &mut Job, expected: ExpectedRevision) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let current = inner.jobs.get(&job.job_id()).map(Job::revision);

        expected
            .check(current)
            .map_err(|e| StoreError::Conflict(format!("job {}: {e}", job.job_id())))?;

        job.set_revision(current.unwrap_or(0) + 1);
        inner
            .by_source
            .insert(job.source_reference().to_path_buf(), job.job_id());
        inner.jobs.insert(job.job_id(), job.clone());
        Ok(())
    }

    fn purge(&self, job_id: JobId) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let job = inner.jobs.remove(&job_id).ok_or(StoreError::NotFound(job_id))?;
        inner.by_source.remove(job.source_reference());
        Ok(())
    }

    fn max_fence(&self) -> Result<FencingToken, StoreError> {
        Ok(self
            .read()?
            .jobs
            .values()
            .map(Job::fence)
            .max()
            .unwrap_or(FencingToken::ZERO))
    }
}
