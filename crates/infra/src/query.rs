//! Read-only observability surface.
//!
//! Views expose state, attempts, errors and history. Fencing tokens and lease
//! data stay internal.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use im2_core::{Classification, Job, JobError, JobId, JobState, OwnerId, Stage, TraceId};

use crate::locks::{LockManager, attempt_is_live};
use crate::pause::PauseGate;
use crate::store::{JobFilter, JobStore, StoreError};

/// Aggregate counts across all jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub per_state: BTreeMap<JobState, usize>,
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    /// Jobs waiting for the router or for a worker to claim them.
    pub queue_depth: usize,
    pub stuck: usize,
    pub needs_attention: usize,
    pub paused: bool,
}

impl PipelineStats {
    pub fn compute(jobs: &[Job], now: DateTime<Utc>, stuck_threshold: Duration, paused: bool) -> Self {
        Self::compute_with(jobs, now, stuck_threshold, paused, |_| false)
    }

    /// Like [`PipelineStats::compute`], but a job whose attempt is still
    /// `live` (its holder keeps renewing the lease) is never counted as stuck.
    pub fn compute_with(
        jobs: &[Job],
        now: DateTime<Utc>,
        stuck_threshold: Duration,
        paused: bool,
        live: impl Fn(&Job) -> bool,
    ) -> Self {
        let mut stats = PipelineStats {
            paused,
            ..Default::default()
        };
        for job in jobs {
            let state = job.state();
            *stats.per_state.entry(state).or_default() += 1;
            stats.total += 1;
            if !state.is_terminal() {
                stats.active += 1;
            }
            match state {
                JobState::Completed => stats.completed += 1,
                JobState::Failed | JobState::FailedTerminal => stats.failed += 1,
                _ => {}
            }
            let waiting = matches!(state, JobState::Registered | JobState::Queued)
                || (state.stage().is_some() && job.active_attempt().is_none());
            if waiting {
                stats.queue_depth += 1;
            }
            if job.is_stuck(now, stuck_threshold) && !live(job) {
                stats.stuck += 1;
            }
            if job.attention().is_some() {
                stats.needs_attention += 1;
            }
        }
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputView {
    pub location: PathBuf,
    pub committed_at: DateTime<Utc>,
}

/// Public projection of a job record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job_id: JobId,
    pub owner_id: OwnerId,
    pub trace_id: TraceId,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_reference: PathBuf,
    pub batch_marker: String,
    pub attempt_count: BTreeMap<JobState, u32>,
    pub last_error: Option<JobError>,
    pub classification: Option<Classification>,
    pub output_references: BTreeMap<Stage, OutputView>,
    pub attention: Option<String>,
    pub stage_history: Vec<Value>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        let stage_history = job
            .history()
            .iter()
            .filter_map(|entry| serde_json::to_value(entry).ok())
            .map(|mut value| {
                if let Some(fields) = value.as_object_mut() {
                    fields.remove("fence");
                }
                value
            })
            .collect();
        Self {
            job_id: job.job_id(),
            owner_id: job.owner_id().clone(),
            trace_id: job.trace_id(),
            state: job.state(),
            created_at: job.created_at(),
            updated_at: job.updated_at(),
            source_reference: job.source_reference().to_path_buf(),
            batch_marker: job.batch_marker().to_string(),
            attempt_count: job.attempt_counts().clone(),
            last_error: job.last_error().cloned(),
            classification: job.classification().cloned(),
            output_references: job
                .output_references()
                .iter()
                .map(|(stage, out)| {
                    (
                        *stage,
                        OutputView {
                            location: out.location.clone(),
                            committed_at: out.committed_at,
                        },
                    )
                })
                .collect(),
            attention: job.attention().map(str::to_string),
            stage_history,
        }
    }
}

/// Query handle for health/metrics collaborators.
#[derive(Clone)]
pub struct PipelineQuery {
    store: Arc<dyn JobStore>,
    pause: Arc<PauseGate>,
    stuck_threshold: Duration,
    locks: Option<Arc<dyn LockManager>>,
}

impl PipelineQuery {
    pub fn new(store: Arc<dyn JobStore>, pause: Arc<PauseGate>, stuck_threshold: Duration) -> Self {
        Self {
            store,
            pause,
            stuck_threshold,
            locks: None,
        }
    }

    /// Consult `locks` so heartbeating attempts are not reported as stuck.
    pub fn with_locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn job(&self, job_id: JobId) -> Result<Option<JobView>, StoreError> {
        Ok(self.store.get(job_id)?.as_ref().map(JobView::from))
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<JobView>, StoreError> {
        Ok(self.store.list(filter)?.iter().map(JobView::from).collect())
    }

    pub fn stats(&self) -> Result<PipelineStats, StoreError> {
        let jobs = self.store.list(&JobFilter::all())?;
        let live = |job: &Job| {
            self.locks
                .as_deref()
                .is_some_and(|locks| attempt_is_live(locks, job).unwrap_or(false))
        };
        Ok(PipelineStats::compute_with(
            &jobs,
            Utc::now(),
            self.stuck_threshold,
            self.pause.is_paused(),
            live,
        ))
    }
}
