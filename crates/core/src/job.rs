//! The durable job record.
//!
//! A `Job` is mutated only through the methods below, each of which validates
//! the state-machine edge, enforces its precondition and appends exactly one
//! or more `stage_history` entries. History is never rewritten and
//! `source_reference` never changes after registration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult, ErrorKind, JobError};
use crate::id::{FencingToken, JobId, OwnerId, TraceId, WorkerId};
use crate::retry::RetryPolicy;
use crate::state::{Actor, JobState, Stage};

/// Version of the job record layout written by this build.
pub const JOB_SCHEMA_VERSION: u32 = 1;

/// Optimistic concurrency expectation for a save.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// The record must not exist yet.
    New,
    /// Require the stored record to be at an exact revision.
    Exact(u64),
}

impl ExpectedRevision {
    pub fn matches(self, actual: Option<u64>) -> bool {
        match (self, actual) {
            (ExpectedRevision::New, None) => true,
            (ExpectedRevision::Exact(v), Some(a)) => v == a,
            _ => false,
        }
    }

    pub fn check(self, actual: Option<u64>) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual:?})"
            )))
        }
    }
}

/// Result of the categorizing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Detected container/codec family (e.g. `wav`, `flac`).
    pub format: String,
    pub valid: bool,
    /// Engine requested for separation; `None` means automatic selection.
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub file_info: serde_json::Value,
}

impl Classification {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            valid: true,
            engine: None,
            file_info: serde_json::Value::Null,
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    pub fn invalid(mut self) -> Self {
        self.valid = false;
        self
    }
}

/// Location of a committed stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputReference {
    pub stage: Stage,
    pub location: PathBuf,
    /// Token of the lease that published it.
    pub fence: FencingToken,
    pub committed_at: DateTime<Utc>,
}

/// The attempt currently bound to the job's working stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAttempt {
    pub stage: Stage,
    pub attempt: u32,
    pub fence: FencingToken,
    pub worker: WorkerId,
    pub started_at: DateTime<Utc>,
    /// Lease expiry at grant time; the sweeper uses it after restarts when no
    /// lock table survives.
    pub lease_expires_at: DateTime<Utc>,
}

/// What happened, as recorded in `stage_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum HistoryEvent {
    Registered {
        source: PathBuf,
    },
    Transition {
        from: JobState,
        to: JobState,
    },
    AttemptStarted {
        stage: Stage,
        attempt: u32,
        fence: FencingToken,
    },
    OutputCommitted {
        stage: Stage,
        location: PathBuf,
    },
    ErrorRecorded {
        state: JobState,
        attempt: u32,
        error: JobError,
    },
    RetryScheduled {
        not_before: DateTime<Utc>,
    },
    AttentionFlagged {
        reason: String,
    },
}

/// One entry of the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// 1-based position in the history.
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub actor: Actor,
    #[serde(flatten)]
    pub event: HistoryEvent,
}

/// Outcome of recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The job stays in `failed` until `not_before`, then retries automatically.
    RetryScheduled { not_before: DateTime<Utc> },
    /// The job moved to `failed-terminal`; only an operator can retry it.
    Terminal,
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    job_id: JobId,
    owner_id: OwnerId,
    trace_id: TraceId,
    schema_version: u32,
    state: JobState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    attempt_count: BTreeMap<JobState, u32>,
    #[serde(default)]
    last_error: Option<JobError>,
    #[serde(default)]
    stage_history: Vec<HistoryEntry>,
    source_reference: PathBuf,
    #[serde(default)]
    output_references: BTreeMap<Stage, OutputReference>,

    batch_marker: String,
    detection_seq: u64,
    #[serde(default)]
    classification: Option<Classification>,
    revision: u64,
    fence: FencingToken,
    #[serde(default)]
    active_attempt: Option<ActiveAttempt>,
    #[serde(default)]
    failed_from: Option<JobState>,
    #[serde(default)]
    retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    attention: Option<String>,
}

impl Job {
    /// Create the record for a stability-confirmed arrival.
    pub fn register(
        owner_id: OwnerId,
        source_reference: PathBuf,
        batch_marker: impl Into<String>,
        detection_seq: u64,
        at: DateTime<Utc>,
    ) -> Self {
        let mut job = Self {
            job_id: JobId::new(),
            owner_id,
            trace_id: TraceId::new(),
            schema_version: JOB_SCHEMA_VERSION,
            state: JobState::Registered,
            created_at: at,
            updated_at: at,
            attempt_count: BTreeMap::new(),
            last_error: None,
            stage_history: Vec::new(),
            source_reference: source_reference.clone(),
            output_references: BTreeMap::new(),
            batch_marker: batch_marker.into(),
            detection_seq,
            classification: None,
            revision: 0,
            fence: FencingToken::ZERO,
            active_attempt: None,
            failed_from: None,
            retry_at: None,
            attention: None,
        };
        job.record(
            Actor::Registrar,
            HistoryEvent::Registered {
                source: source_reference,
            },
            at,
        );
        job
    }

    // ---- accessors -------------------------------------------------------

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Attempts made for a state (0 if never entered).
    pub fn attempts(&self, state: JobState) -> u32 {
        self.attempt_count.get(&state).copied().unwrap_or(0)
    }

    pub fn attempt_counts(&self) -> &BTreeMap<JobState, u32> {
        &self.attempt_count
    }

    pub fn last_error(&self) -> Option<&JobError> {
        self.last_error.as_ref()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.stage_history
    }

    pub fn source_reference(&self) -> &Path {
        &self.source_reference
    }

    pub fn output_references(&self) -> &BTreeMap<Stage, OutputReference> {
        &self.output_references
    }

    pub fn batch_marker(&self) -> &str {
        &self.batch_marker
    }

    pub fn detection_seq(&self) -> u64 {
        self.detection_seq
    }

    pub fn classification(&self) -> Option<&Classification> {
        self.classification.as_ref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn fence(&self) -> FencingToken {
        self.fence
    }

    pub fn active_attempt(&self) -> Option<&ActiveAttempt> {
        self.active_attempt.as_ref()
    }

    pub fn failed_from(&self) -> Option<JobState> {
        self.failed_from
    }

    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        self.retry_at
    }

    pub fn attention(&self) -> Option<&str> {
        self.attention.as_deref()
    }

    /// Input for a stage: the source artifact or the previous stage's output.
    pub fn input_reference(&self, stage: Stage) -> Option<&Path> {
        match stage.input_stage() {
            None => Some(self.source_reference.as_path()),
            Some(prev) => self
                .output_references
                .get(&prev)
                .map(|o| o.location.as_path()),
        }
    }

    /// Non-terminal and not updated within `threshold`.
    pub fn is_stuck(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        !self.state.is_terminal() && now - self.updated_at > threshold
    }

    /// Whether a scheduled automatic retry is due.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Failed && self.retry_at.is_some_and(|at| at <= now)
    }

    /// Storage bookkeeping: set after a successful compare-and-swap save.
    pub fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    // ---- transitions -----------------------------------------------------

    /// Move along a router-driven edge (admission, dispatch, cancellation).
    pub fn transition(&mut self, to: JobState, actor: Actor, at: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_edge(to, &actor)?;
        // The attempt survives into `cancelling` until its holder lets go.
        let keeps_attempt = matches!(to, JobState::Failed | JobState::Cancelling);
        if (self.state.stage().is_some() && !keeps_attempt) || to.is_terminal() {
            self.active_attempt = None;
        }
        self.apply_transition(to, actor, at);
        Ok(())
    }

    /// Bind a freshly granted lease to the job's current working stage.
    ///
    /// Returns the attempt number that starts now.
    pub fn begin_attempt(
        &mut self,
        stage: Stage,
        fence: FencingToken,
        worker: WorkerId,
        lease_expires_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> DomainResult<u32> {
        if self.state != stage.state() {
            return Err(DomainError::conflict(format!(
                "job {} is {}, not {stage}",
                self.job_id, self.state
            )));
        }
        if fence <= self.fence {
            return Err(DomainError::conflict(format!(
                "stale fencing token {fence} (current {})",
                self.fence
            )));
        }

        let attempt = self.attempts(self.state) + 1;
        self.attempt_count.insert(self.state, attempt);
        self.fence = fence;
        self.active_attempt = Some(ActiveAttempt {
            stage,
            attempt,
            fence,
            worker: worker.clone(),
            started_at: at,
            lease_expires_at,
        });
        self.record(
            Actor::Worker(worker.to_string()),
            HistoryEvent::AttemptStarted {
                stage,
                attempt,
                fence,
            },
            at,
        );
        Ok(attempt)
    }

    /// Reject anything but the current holder of the current stage.
    pub fn check_fence(&self, stage: Stage, fence: FencingToken) -> DomainResult<()> {
        if self.state != stage.state() {
            return Err(DomainError::conflict(format!(
                "job {} moved to {} while {stage} was in flight",
                self.job_id, self.state
            )));
        }
        match &self.active_attempt {
            Some(active) if active.fence == fence && self.fence == fence => Ok(()),
            _ => Err(DomainError::conflict(format!(
                "stale fencing token {fence} (current {})",
                self.fence
            ))),
        }
    }

    /// Handoff commit: publish `output` and advance to the stage's successor.
    pub fn complete_stage(
        &mut self,
        stage: Stage,
        fence: FencingToken,
        output: Option<OutputReference>,
        classification: Option<Classification>,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.check_fence(stage, fence)?;
        let to = stage.next_state();
        self.ensure_edge(to, &actor)?;

        if stage == Stage::Categorizing {
            match &classification {
                Some(c) if c.valid => {}
                Some(c) => {
                    return Err(DomainError::precondition(format!(
                        "classification rejected the artifact (format {})",
                        c.format
                    )));
                }
                None => {
                    return Err(DomainError::precondition(
                        "categorizing requires a classification result",
                    ));
                }
            }
        }
        if stage.produces_output() && output.is_none() {
            return Err(DomainError::precondition(format!(
                "{stage} must publish an output"
            )));
        }
        if let Some(out) = &output {
            if out.stage != stage || out.fence != fence {
                return Err(DomainError::validation(format!(
                    "output reference belongs to {} / fence {}",
                    out.stage, out.fence
                )));
            }
        }

        if let Some(c) = classification {
            self.classification = Some(c);
        }
        if let Some(out) = output {
            self.record(
                actor.clone(),
                HistoryEvent::OutputCommitted {
                    stage,
                    location: out.location.clone(),
                },
                at,
            );
            // One reference per stage: a replayed stage replaces its own entry.
            self.output_references.insert(stage, out);
        }
        self.active_attempt = None;
        self.apply_transition(to, actor, at);
        Ok(())
    }

    /// Record a failure and move to `failed`, then decide between a scheduled
    /// retry and `failed-terminal`.
    ///
    /// The error is appended to history before any state change.
    pub fn fail(
        &mut self,
        error: JobError,
        policy: &RetryPolicy,
        actor: Actor,
        at: DateTime<Utc>,
    ) -> DomainResult<FailureDisposition> {
        self.ensure_edge(JobState::Failed, &actor)?;

        let failed_state = self.state;
        let attempt = self.attempts(failed_state);
        self.record(
            actor.clone(),
            HistoryEvent::ErrorRecorded {
                state: failed_state,
                attempt,
                error: error.clone(),
            },
            at,
        );
        self.last_error = Some(error.clone());
        self.failed_from = Some(failed_state);
        self.active_attempt = None;
        self.apply_transition(JobState::Failed, actor.clone(), at);

        if error.kind.is_auto_retryable() && policy.should_retry(attempt) {
            let delay = policy.delay_for_attempt(attempt.max(1));
            let not_before = at + chrono::Duration::from_std(delay).unwrap_or_default();
            self.retry_at = Some(not_before);
            self.record(actor, HistoryEvent::RetryScheduled { not_before }, at);
            Ok(FailureDisposition::RetryScheduled { not_before })
        } else {
            self.retry_at = None;
            self.apply_transition(JobState::FailedTerminal, actor, at);
            Ok(FailureDisposition::Terminal)
        }
    }

    /// `failed → queued`, or `failed-terminal → queued` with operator override.
    ///
    /// An override resets the attempt counter of the stage that failed.
    pub fn retry(&mut self, policy: &RetryPolicy, actor: Actor, at: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_edge(JobState::Queued, &actor)?;

        match self.state {
            JobState::Failed => {
                let failed = self.failed_from.unwrap_or(JobState::Queued);
                let attempts = self.attempts(failed);
                if !policy.should_retry(attempts) {
                    return Err(DomainError::RetryCeilingReached {
                        state: failed,
                        attempts,
                    });
                }
            }
            JobState::FailedTerminal => {
                if let Some(failed) = self.failed_from {
                    self.attempt_count.insert(failed, 0);
                }
            }
            other => {
                return Err(DomainError::IllegalTransition {
                    from: other,
                    to: JobState::Queued,
                });
            }
        }

        self.retry_at = None;
        self.attention = None;
        self.apply_transition(JobState::Queued, actor, at);
        Ok(())
    }

    /// Flag for operator attention. Repeating the same reason is a no-op.
    pub fn flag_attention(&mut self, reason: impl Into<String>, actor: Actor, at: DateTime<Utc>) -> bool {
        let reason = reason.into();
        if self.attention.as_deref() == Some(reason.as_str()) {
            return false;
        }
        self.attention = Some(reason.clone());
        self.record(actor, HistoryEvent::AttentionFlagged { reason }, at);
        true
    }

    // ---- internals -------------------------------------------------------

    fn ensure_edge(&self, to: JobState, actor: &Actor) -> DomainResult<()> {
        if self.state.can_transition(to, actor) {
            Ok(())
        } else {
            Err(DomainError::IllegalTransition {
                from: self.state,
                to,
            })
        }
    }

    fn apply_transition(&mut self, to: JobState, actor: Actor, at: DateTime<Utc>) {
        let from = self.state;
        self.state = to;
        self.record(actor, HistoryEvent::Transition { from, to }, at);
    }

    fn record(&mut self, actor: Actor, event: HistoryEvent, at: DateTime<Utc>) {
        // Timestamps never move backwards, even if the wall clock does.
        let at = at.max(self.updated_at);
        self.updated_at = at;
        self.stage_history.push(HistoryEntry {
            seq: self.stage_history.len() as u64 + 1,
            at,
            actor,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn new_job() -> Job {
        Job::register(
            OwnerId::parse("owner-42").unwrap(),
            PathBuf::from("/intake/owner-42/batch-1/track.wav"),
            "batch-1",
            1,
            Utc::now(),
        )
    }

    fn worker() -> WorkerId {
        WorkerId::parse("w1").unwrap()
    }

    fn lease_end() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(30)
    }

    fn output(stage: Stage, fence: FencingToken) -> OutputReference {
        OutputReference {
            stage,
            location: PathBuf::from(format!("/out/{stage}/v{fence}")),
            fence,
            committed_at: Utc::now(),
        }
    }

    /// Drive a job through `stage` with the given token.
    fn run_stage(job: &mut Job, stage: Stage, fence: u64) {
        let fence = FencingToken::new(fence);
        job.begin_attempt(stage, fence, worker(), lease_end(), Utc::now())
            .unwrap();
        let (out, class) = if stage == Stage::Categorizing {
            (None, Some(Classification::new("wav")))
        } else {
            (Some(output(stage, fence)), None)
        };
        job.complete_stage(stage, fence, out, class, Actor::Worker("w1".into()), Utc::now())
            .unwrap();
    }

    #[test]
    fn registration_records_history() {
        let job = new_job();
        assert_eq!(job.state(), JobState::Registered);
        assert_eq!(job.history().len(), 1);
        assert_eq!(job.schema_version(), JOB_SCHEMA_VERSION);
        assert!(matches!(
            job.history()[0].event,
            HistoryEvent::Registered { .. }
        ));
    }

    #[test]
    fn full_pipeline_reaches_completed_with_one_output_per_stage() {
        let mut job = new_job();
        job.transition(JobState::Categorizing, Actor::Router, Utc::now()).unwrap();
        run_stage(&mut job, Stage::Categorizing, 1);
        assert_eq!(job.state(), JobState::Queued);
        job.transition(JobState::Staging, Actor::Router, Utc::now()).unwrap();
        run_stage(&mut job, Stage::Staging, 2);
        run_stage(&mut job, Stage::Separating, 3);
        run_stage(&mut job, Stage::Reconstructing, 4);
        run_stage(&mut job, Stage::Organizing, 5);

        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.output_references().len(), 4);
        assert_eq!(
            job.input_reference(Stage::Separating),
            Some(Path::new("/out/staging/v2"))
        );
        let seqs: Vec<u64> = job.history().iter().map(|h| h.seq).collect();
        assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn categorizing_requires_valid_classification() {
        let mut job = new_job();
        job.transition(JobState::Categorizing, Actor::Router, Utc::now()).unwrap();
        let fence = FencingToken::new(1);
        job.begin_attempt(Stage::Categorizing, fence, worker(), lease_end(), Utc::now())
            .unwrap();

        let err = job
            .complete_stage(Stage::Categorizing, fence, None, None, Actor::Router, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(_)));

        let err = job
            .complete_stage(
                Stage::Categorizing,
                fence,
                None,
                Some(Classification::new("txt").invalid()),
                Actor::Router,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::PreconditionFailed(_)));
        assert_eq!(job.state(), JobState::Categorizing);
    }

    #[test]
    fn stale_fence_is_a_conflict() {
        let mut job = new_job();
        job.transition(JobState::Categorizing, Actor::Router, Utc::now()).unwrap();
        job.begin_attempt(Stage::Categorizing, FencingToken::new(5), worker(), lease_end(), Utc::now())
            .unwrap();

        // A lower token can neither bind nor commit.
        let err = job
            .begin_attempt(Stage::Categorizing, FencingToken::new(4), worker(), lease_end(), Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = job
            .complete_stage(
                Stage::Categorizing,
                FencingToken::new(4),
                None,
                Some(Classification::new("wav")),
                Actor::Router,
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn transient_failure_schedules_retry_until_ceiling() {
        let policy = RetryPolicy::fixed(2, Duration::from_millis(10));
        let mut job = new_job();
        job.transition(JobState::Categorizing, Actor::Router, Utc::now()).unwrap();
        run_stage(&mut job, Stage::Categorizing, 1);
        job.transition(JobState::Staging, Actor::Router, Utc::now()).unwrap();

        job.begin_attempt(Stage::Staging, FencingToken::new(2), worker(), lease_end(), Utc::now())
            .unwrap();
        let d = job
            .fail(JobError::transient("disk full"), &policy, Actor::Router, Utc::now())
            .unwrap();
        assert!(matches!(d, FailureDisposition::RetryScheduled { .. }));
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.last_error().unwrap().kind, ErrorKind::Transient);

        job.retry(&policy, Actor::Router, Utc::now()).unwrap();
        assert_eq!(job.state(), JobState::Queued);
        job.transition(JobState::Staging, Actor::Router, Utc::now()).unwrap();
        job.begin_attempt(Stage::Staging, FencingToken::new(3), worker(), lease_end(), Utc::now())
            .unwrap();
        assert_eq!(job.attempts(JobState::Staging), 2);

        let d = job
            .fail(JobError::timeout("hard limit"), &policy, Actor::Sweeper, Utc::now())
            .unwrap();
        assert_eq!(d, FailureDisposition::Terminal);
        assert_eq!(job.state(), JobState::FailedTerminal);

        // Operator override resets the failed stage's counter.
        assert!(job.retry(&policy, Actor::Router, Utc::now()).is_err());
        job.retry(&policy, Actor::Operator, Utc::now()).unwrap();
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.attempts(JobState::Staging), 0);
    }

    #[test]
    fn validation_failure_is_terminal_immediately() {
        let mut job = new_job();
        let d = job
            .fail(
                JobError::validation("unsupported container"),
                &RetryPolicy::default(),
                Actor::Router,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(d, FailureDisposition::Terminal);

        // Error recorded before the transitions.
        let tail: Vec<_> = job.history().iter().rev().take(3).collect();
        assert!(matches!(tail[2].event, HistoryEvent::ErrorRecorded { .. }));
        assert!(matches!(
            tail[0].event,
            HistoryEvent::Transition {
                to: JobState::FailedTerminal,
                ..
            }
        ));
    }

    #[test]
    fn updated_at_never_moves_backwards() {
        let mut job = new_job();
        let before = job.updated_at();
        job.transition(
            JobState::Categorizing,
            Actor::Router,
            before - chrono::Duration::hours(1),
        )
        .unwrap();
        assert!(job.updated_at() >= before);
    }

    #[test]
    fn attention_flag_is_deduplicated() {
        let mut job = new_job();
        assert!(job.flag_attention("no worker", Actor::Sweeper, Utc::now()));
        let len = job.history().len();
        assert!(!job.flag_attention("no worker", Actor::Sweeper, Utc::now()));
        assert_eq!(job.history().len(), len);
    }

    #[test]
    fn job_record_round_trips_through_json() {
        let mut job = new_job();
        job.transition(JobState::Categorizing, Actor::Router, Utc::now()).unwrap();
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["state"], "categorizing");
        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Advance,
        FailTransient,
        FailValidation,
        Retry,
        OperatorRetry,
        Cancel,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => Just(Step::Advance),
            2 => Just(Step::FailTransient),
            1 => Just(Step::FailValidation),
            2 => Just(Step::Retry),
            1 => Just(Step::OperatorRetry),
            1 => Just(Step::Cancel),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: for any sequence of operations, history only grows, every
        /// recorded transition is a legal edge, and no stage is attempted more
        /// often than the ceiling allows without an operator override.
        #[test]
        fn state_machine_invariants_hold(steps in prop::collection::vec(step(), 1..60), ceiling in 1u32..4) {
            let policy = RetryPolicy::fixed(ceiling, Duration::ZERO);
            let mut job = new_job();
            let mut fence = 0u64;
            let mut overrides = 0u32;
            let mut prev_len = job.history().len();

            for s in steps {
                let now = Utc::now();
                let _ = match s {
                    Step::Advance => match job.state() {
                        JobState::Registered => job.transition(JobState::Categorizing, Actor::Router, now),
                        JobState::Queued => job.transition(JobState::Staging, Actor::Router, now),
                        JobState::Cancelling => job.transition(JobState::FailedTerminal, Actor::Router, now),
                        state => match state.stage() {
                            Some(stage) => {
                                fence += 1;
                                let token = FencingToken::new(fence);
                                job.begin_attempt(stage, token, worker(), now, now)
                                    .and_then(|_| {
                                        let (out, class) = if stage == Stage::Categorizing {
                                            (None, Some(Classification::new("wav")))
                                        } else {
                                            (Some(output(stage, token)), None)
                                        };
                                        job.complete_stage(stage, token, out, class, Actor::Router, now)
                                    })
                            }
                            None => Ok(()),
                        },
                    },
                    Step::FailTransient => job
                        .fail(JobError::transient("x"), &policy, Actor::Router, now)
                        .map(|_| ()),
                    Step::FailValidation => job
                        .fail(JobError::validation("x"), &policy, Actor::Router, now)
                        .map(|_| ()),
                    Step::Retry => job.retry(&policy, Actor::Router, now),
                    Step::OperatorRetry => {
                        let r = job.retry(&policy, Actor::Operator, now);
                        if r.is_ok() {
                            overrides += 1;
                        }
                        r
                    }
                    Step::Cancel => job.transition(JobState::Cancelling, Actor::Operator, now),
                };

                prop_assert!(job.history().len() >= prev_len);
                prev_len = job.history().len();
            }

            for entry in job.history() {
                if let HistoryEvent::Transition { from, to } = entry.event {
                    prop_assert!(from.can_transition(to, &entry.actor), "{from} -> {to} by {}", entry.actor);
                }
            }
            if overrides == 0 {
                for (_, attempts) in job.attempt_counts() {
                    prop_assert!(*attempts <= ceiling);
                }
            }
            prop_assert!(job.output_references().len() <= Stage::ALL.len() - 1);
        }
    }
}
