//! Pipeline notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use im2_core::{ErrorKind, Job, JobId, JobState, OwnerId, TraceId};

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PipelineEventKind {
    JobRegistered,
    StateChanged { from: JobState, to: JobState },
    RetryScheduled { not_before: DateTime<Utc> },
    JobFailed { error_kind: ErrorKind, terminal: bool },
    CancelRequested,
    JobDeleted,
    AttentionFlagged { reason: String },
    Quarantined { reason: String },
    Paused,
    Resumed,
}

impl PipelineEventKind {
    /// Whether the event is about one job (as opposed to the whole pipeline).
    pub fn is_job_event(&self) -> bool {
        !matches!(
            self,
            PipelineEventKind::Paused | PipelineEventKind::Resumed | PipelineEventKind::Quarantined { .. }
        )
    }
}

/// A committed change, as seen by observers.
///
/// Carries no fencing or lease details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub owner_id: Option<OwnerId>,
    #[serde(default)]
    pub trace_id: Option<TraceId>,
    #[serde(default)]
    pub state: Option<JobState>,
    #[serde(flatten)]
    pub kind: PipelineEventKind,
}

impl PipelineEvent {
    /// Event about `job`, stamped with its current state.
    pub fn for_job(job: &Job, kind: PipelineEventKind) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            job_id: Some(job.job_id()),
            owner_id: Some(job.owner_id().clone()),
            trace_id: Some(job.trace_id()),
            state: Some(job.state()),
            kind,
        }
    }

    /// Pipeline-wide event (pause, resume, quarantine).
    pub fn system(kind: PipelineEventKind) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
            job_id: None,
            owner_id: None,
            trace_id: None,
            state: None,
            kind,
        }
    }

    pub fn with_owner(mut self, owner: OwnerId) -> Self {
        self.owner_id = Some(owner);
        self
    }
}
