//! Stage router: the only writer of job state.
//!
//! Every edge is committed as a compare-and-swap on the job record while the
//! caller holds the advisory lock for the job's current state:
//!
//! - router-driven edges (`registered → categorizing`, `queued → staging`,
//!   `failed → queued`) take the lock briefly through [`StageRouter::with_state_lock`];
//! - working stages are claimed by workers ([`StageRouter::claim`]) and the lock
//!   is held for the whole attempt, renewed by heartbeat, and released at
//!   commit ([`StageRouter::complete`]) or failure ([`StageRouter::fail`]).
//!
//! Sweeper bookkeeping (timing out a silent attempt, attention flags) goes
//! through the same lock, so it never races a worker's commit.
//!
//! Operator cancellation is the one edge written without the stage lock: it
//! moves the job to `cancelling` by revision CAS and the lock holder observes
//! it at its next checkpoint.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use im2_core::{
    Actor, Classification, DomainError, ExpectedRevision, FailureDisposition, FencingToken, Job,
    JobError, JobId, JobState, OwnerId, RetryPolicy, Stage, TraceId, WorkerId,
};
use im2_events::{PipelineEvent, PipelineEventKind};
use im2_observability::job_span;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::handoff::HandoffArea;
use crate::locks::{LeaseGrant, LockError, LockKey, LockManager, attempt_is_live};
use crate::pause::PauseGate;
use crate::publish::EventSink;
use crate::store::{JobFilter, JobStore};

/// Engine requested when no classification names one.
pub const AUTO_ENGINE: &str = "auto";

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Lease granted with every lock.
    pub lease: Duration,
    /// Upper bound for blocking acquisition.
    pub lock_timeout: Duration,
    pub retry: RetryPolicy,
    pub default_stage_timeout: Duration,
    pub stage_timeouts: BTreeMap<Stage, Duration>,
    /// Free-form parameters handed to the worker of each stage.
    pub stage_params: BTreeMap<Stage, Value>,
}

impl RouterSettings {
    pub fn new(lease: Duration, lock_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            lease,
            lock_timeout,
            retry,
            default_stage_timeout: Duration::from_secs(30 * 60),
            stage_timeouts: BTreeMap::new(),
            stage_params: BTreeMap::new(),
        }
    }

    pub fn stage_timeout(&self, stage: Stage) -> Duration {
        self.stage_timeouts
            .get(&stage)
            .copied()
            .unwrap_or(self.default_stage_timeout)
    }
}

/// Per-attempt configuration handed to a stage worker.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    pub hard_limit: Duration,
    pub engine: String,
    pub params: Value,
}

/// What a worker is told to do: `(job_id, fencing_token, input_reference, stage_config)`.
#[derive(Debug, Clone)]
pub struct StageTicket {
    pub job_id: JobId,
    pub trace_id: TraceId,
    pub owner_id: OwnerId,
    pub stage: Stage,
    pub attempt: u32,
    pub fence: FencingToken,
    pub input: PathBuf,
    /// Private directory the worker writes its output into.
    pub workspace: PathBuf,
    pub config: StageConfig,
}

/// A claimed attempt: the ticket plus the lease backing it.
#[derive(Debug)]
pub struct StageLease {
    ticket: StageTicket,
    grant: LeaseGrant,
    started: Instant,
}

impl StageLease {
    pub fn ticket(&self) -> &StageTicket {
        &self.ticket
    }

    pub fn grant(&self) -> &LeaseGrant {
        &self.grant
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn past_hard_limit(&self) -> bool {
        self.elapsed() > self.ticket.config.hard_limit
    }
}

/// What a worker should do at a safe point.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    /// The job left the stage (cancel, delete); abort and release.
    Cancelled,
    /// The lease expired or was taken over; stop without committing.
    LeaseLost,
    /// The stage's hard limit passed.
    TimedOut,
}

/// Result of a stage's external work, reported at commit.
#[derive(Debug, Clone, Default)]
pub struct StageSuccess {
    pub classification: Option<Classification>,
}

/// How a commit was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Committed {
    /// Output published and the job advanced.
    Advanced(JobState),
    /// The result failed a precondition; the job was routed to failure.
    Rejected(FailureDisposition),
}

pub struct StageRouter {
    store: Arc<dyn JobStore>,
    locks: Arc<dyn LockManager>,
    pause: Arc<PauseGate>,
    handoff: HandoffArea,
    events: Arc<dyn EventSink>,
    settings: RouterSettings,
    identity: WorkerId,
}

impl StageRouter {
    pub fn new(
        store: Arc<dyn JobStore>,
        locks: Arc<dyn LockManager>,
        pause: Arc<PauseGate>,
        handoff: HandoffArea,
        events: Arc<dyn EventSink>,
        settings: RouterSettings,
    ) -> Self {
        Self {
            store,
            locks,
            pause,
            handoff,
            events,
            settings,
            identity: WorkerId::generate("router"),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    pub fn handoff(&self) -> &HandoffArea {
        &self.handoff
    }

    pub fn pause_gate(&self) -> &Arc<PauseGate> {
        &self.pause
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    // ---- router-driven edges ---------------------------------------------

    /// `registered → categorizing`. Returns `false` if paused, contended or already admitted.
    pub fn admit(&self, job_id: JobId) -> OrchestratorResult<bool> {
        if self.pause.is_paused() {
            return Ok(false);
        }
        self.router_edge(job_id, JobState::Registered, JobState::Categorizing)
    }

    /// `queued → staging`.
    pub fn dispatch(&self, job_id: JobId) -> OrchestratorResult<bool> {
        if self.pause.is_paused() {
            return Ok(false);
        }
        self.router_edge(job_id, JobState::Queued, JobState::Staging)
    }

    /// Admit every registered job and dispatch every queued job, oldest first.
    pub fn drive_pending(&self) -> OrchestratorResult<usize> {
        let mut moved = 0;
        for job in self.store.list(&JobFilter::in_state(JobState::Registered))? {
            if self.admit(job.job_id())? {
                moved += 1;
            }
        }
        for job in self.store.list(&JobFilter::in_state(JobState::Queued))? {
            if self.dispatch(job.job_id())? {
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// `failed → queued` once the retry backoff has elapsed.
    pub fn requeue_if_due(&self, job_id: JobId) -> OrchestratorResult<bool> {
        let now = Utc::now();
        let retry = self.settings.retry.clone();
        self.with_state_lock(job_id, JobState::Failed, |job| {
            if !job.retry_due(now) {
                return Ok(false);
            }
            job.retry(&retry, Actor::Router, now)?;
            Ok(true)
        })
    }

    fn router_edge(&self, job_id: JobId, from: JobState, to: JobState) -> OrchestratorResult<bool> {
        self.with_state_lock(job_id, from, |job| {
            job.transition(to, Actor::Router, Utc::now())?;
            Ok(true)
        })
    }

    /// Run `edit` on the job while holding the lock for `state`, then commit
    /// and announce the change.
    ///
    /// `false` if the lock is held elsewhere, the job is no longer in `state`,
    /// or `edit` returned `Ok(false)`.
    pub(crate) fn with_state_lock(
        &self,
        job_id: JobId,
        state: JobState,
        edit: impl FnOnce(&mut Job) -> OrchestratorResult<bool>,
    ) -> OrchestratorResult<bool> {
        let Some((before, after)) = self.locked_edit(job_id, state, edit)? else {
            return Ok(false);
        };
        if before.state() != after.state() {
            info!(job_id = %job_id, trace_id = %after.trace_id(), state = %after.state(), from = %before.state(), "job advanced");
        }
        self.announce(&before, &after);
        Ok(true)
    }

    /// Lock, load, edit and save. Returns the record before and after the
    /// save, leaving announcements to the caller.
    fn locked_edit(
        &self,
        job_id: JobId,
        state: JobState,
        edit: impl FnOnce(&mut Job) -> OrchestratorResult<bool>,
    ) -> OrchestratorResult<Option<(Job, Job)>> {
        let key = LockKey::new(job_id, state);
        let Some(grant) = self.locks.try_acquire(key, &self.identity, self.settings.lease)? else {
            return Ok(None);
        };

        let result = self.edit_under_grant(job_id, state, edit);
        if let Err(err) = self.locks.release(&grant) {
            warn!(job_id = %job_id, state = %state, error = %err, "failed to release router lock");
        }
        result
    }

    fn edit_under_grant(
        &self,
        job_id: JobId,
        state: JobState,
        edit: impl FnOnce(&mut Job) -> OrchestratorResult<bool>,
    ) -> OrchestratorResult<Option<(Job, Job)>> {
        let Some(mut job) = self.store.get(job_id)? else {
            return Ok(None);
        };
        if job.state() != state {
            return Ok(None);
        }
        let before = job.clone();
        if !edit(&mut job)? {
            return Ok(None);
        }
        self.store.save(&mut job, ExpectedRevision::Exact(before.revision()))?;
        Ok(Some((before, job)))
    }

    // ---- working stages --------------------------------------------------

    /// Claim the oldest job waiting in `stage` that has no attempt in flight.
    ///
    /// Nothing is granted while the pipeline is paused.
    pub fn claim(&self, stage: Stage, worker: &WorkerId) -> OrchestratorResult<Option<StageLease>> {
        if self.pause.is_paused() {
            return Ok(None);
        }
        let candidates = self.store.list(&JobFilter::in_state(stage.state()))?;
        for candidate in candidates {
            if candidate.active_attempt().is_some() {
                // Left for the sweeper to time out once its lease lapses.
                continue;
            }
            let key = LockKey::new(candidate.job_id(), stage.state());
            let Some(grant) = self.locks.try_acquire(key, worker, self.settings.lease)? else {
                continue;
            };
            match self.begin(stage, worker, &grant) {
                Ok(Some(lease)) => return Ok(Some(lease)),
                Ok(None) => {
                    self.release(&grant);
                }
                Err(err) if err.is_conflict() => {
                    debug!(job_id = %key.job_id, error = %err, "claim lost a race");
                    self.release(&grant);
                }
                Err(err) => {
                    self.release(&grant);
                    return Err(err);
                }
            }
        }
        Ok(None)
    }

    fn begin(&self, stage: Stage, worker: &WorkerId, grant: &LeaseGrant) -> OrchestratorResult<Option<StageLease>> {
        let Some(mut job) = self.store.get(grant.key.job_id)? else {
            return Ok(None);
        };
        if job.state() != stage.state() || job.active_attempt().is_some() {
            return Ok(None);
        }
        let span = job_span(&job.job_id(), &job.trace_id());
        let _entered = span.enter();

        let Some(input) = job.input_reference(stage).map(PathBuf::from) else {
            // Previous output vanished from the record: not retryable by itself.
            let revision = job.revision();
            let before = job.clone();
            job.fail(
                JobError::validation(format!("no input available for {stage}")),
                &self.settings.retry,
                Actor::Router,
                Utc::now(),
            )?;
            self.store.save(&mut job, ExpectedRevision::Exact(revision))?;
            self.announce_failure(&before, &job);
            return Ok(None);
        };

        let now = Utc::now();
        let revision = job.revision();
        let attempt = job.begin_attempt(stage, grant.token, worker.clone(), grant.expires_at, now)?;
        let workspace = self.handoff.prepare(job.job_id(), stage, grant.token)?;
        if let Err(err) = self.store.save(&mut job, ExpectedRevision::Exact(revision)) {
            self.discard(&workspace);
            return Err(err.into());
        }

        let engine = job
            .classification()
            .and_then(|c| c.engine.clone())
            .unwrap_or_else(|| AUTO_ENGINE.to_string());
        let ticket = StageTicket {
            job_id: job.job_id(),
            trace_id: job.trace_id(),
            owner_id: job.owner_id().clone(),
            stage,
            attempt,
            fence: grant.token,
            input,
            workspace,
            config: StageConfig {
                hard_limit: self.settings.stage_timeout(stage),
                engine,
                params: self.settings.stage_params.get(&stage).cloned().unwrap_or(Value::Null),
            },
        };
        info!(stage = %stage, attempt, fence = %grant.token, worker = %worker, "stage attempt started");
        Ok(Some(StageLease {
            ticket,
            grant: grant.clone(),
            started: Instant::now(),
        }))
    }

    /// Extend the lease backing `lease`.
    pub fn heartbeat(&self, lease: &mut StageLease) -> OrchestratorResult<()> {
        lease.grant = self.locks.renew(&lease.grant, self.settings.lease)?;
        Ok(())
    }

    /// Safe-point check for a running attempt.
    pub fn checkpoint(&self, lease: &StageLease) -> OrchestratorResult<Checkpoint> {
        match self.locks.validate(&lease.grant) {
            Ok(()) => {}
            Err(LockError::Lost { .. }) => return Ok(Checkpoint::LeaseLost),
            Err(err) => return Err(err.into()),
        }
        let ticket = &lease.ticket;
        let Some(job) = self.store.get(ticket.job_id)? else {
            return Ok(Checkpoint::Cancelled);
        };
        if job.state() != ticket.stage.state() {
            return Ok(Checkpoint::Cancelled);
        }
        if job.fence() != ticket.fence {
            return Ok(Checkpoint::LeaseLost);
        }
        if lease.past_hard_limit() {
            return Ok(Checkpoint::TimedOut);
        }
        Ok(Checkpoint::Continue)
    }

    /// Handoff commit: publish the workspace and advance the job.
    ///
    /// A stale lease or fence is rejected with a conflict and nothing becomes
    /// visible.
    pub fn complete(&self, lease: StageLease, success: StageSuccess) -> OrchestratorResult<Committed> {
        let StageLease { ticket, grant, .. } = lease;
        let span = job_span(&ticket.job_id, &ticket.trace_id);
        let _entered = span.enter();

        if let Err(err) = self.locks.validate(&grant) {
            warn!(stage = %ticket.stage, fence = %ticket.fence, "commit rejected: lease no longer held");
            self.discard(&ticket.workspace);
            return Err(err.into());
        }

        let output = if ticket.stage.produces_output() {
            match self.handoff.publish(ticket.job_id, ticket.stage, ticket.fence) {
                Ok(output) => Some(output),
                Err(err) => {
                    self.release(&grant);
                    return Err(err.into());
                }
            }
        } else {
            self.discard(&ticket.workspace);
            None
        };
        let published = output.as_ref().map(|o| o.location.clone());
        let discard_published = || {
            if let Some(path) = &published {
                self.discard(path);
            }
        };

        let mut job = match self.store.get(ticket.job_id)? {
            Some(job) => job,
            None => {
                discard_published();
                self.release(&grant);
                return Err(OrchestratorError::NotFound(ticket.job_id));
            }
        };
        let before = job.clone();
        let actor = Actor::Worker(grant.holder.to_string());

        match job.complete_stage(ticket.stage, ticket.fence, output, success.classification, actor.clone(), Utc::now()) {
            Ok(()) => {}
            Err(DomainError::PreconditionFailed(reason)) => {
                discard_published();
                let mut job = before.clone();
                let disposition = job.fail(JobError::validation(reason), &self.settings.retry, actor, Utc::now())?;
                let saved = self.store.save(&mut job, ExpectedRevision::Exact(before.revision()));
                self.release(&grant);
                saved?;
                self.announce_failure(&before, &job);
                return Ok(Committed::Rejected(disposition));
            }
            Err(err) => {
                warn!(stage = %ticket.stage, fence = %ticket.fence, error = %err, "commit rejected");
                discard_published();
                self.release(&grant);
                return Err(err.into());
            }
        }

        if let Err(err) = self.store.save(&mut job, ExpectedRevision::Exact(before.revision())) {
            warn!(stage = %ticket.stage, error = %err, "commit lost the revision race");
            discard_published();
            self.release(&grant);
            return Err(err.into());
        }

        if let Some(keep) = &published {
            if let Err(err) = self.handoff.retain_only(ticket.job_id, ticket.stage, keep) {
                warn!(stage = %ticket.stage, error = %err, "failed to prune superseded outputs");
            }
        }
        self.release(&grant);
        info!(stage = %ticket.stage, to = %job.state(), "stage committed");
        self.announce(&before, &job);
        Ok(Committed::Advanced(job.state()))
    }

    /// Report a failed attempt. The error is recorded before the state changes.
    pub fn fail(&self, lease: StageLease, error: JobError) -> OrchestratorResult<FailureDisposition> {
        let StageLease { ticket, grant, .. } = lease;
        let span = job_span(&ticket.job_id, &ticket.trace_id);
        let _entered = span.enter();

        self.discard(&ticket.workspace);
        let result = self.record_failure(&ticket, &grant, error);
        self.release(&grant);
        result
    }

    fn record_failure(&self, ticket: &StageTicket, grant: &LeaseGrant, error: JobError) -> OrchestratorResult<FailureDisposition> {
        let mut job = self
            .store
            .get(ticket.job_id)?
            .ok_or(OrchestratorError::NotFound(ticket.job_id))?;
        job.check_fence(ticket.stage, ticket.fence)?;
        let before = job.clone();
        warn!(stage = %ticket.stage, attempt = ticket.attempt, error = %error, "stage attempt failed");
        let disposition = job.fail(error, &self.settings.retry, Actor::Worker(grant.holder.to_string()), Utc::now())?;
        self.store.save(&mut job, ExpectedRevision::Exact(before.revision()))?;
        self.announce_failure(&before, &job);
        Ok(disposition)
    }

    /// Stop a claimed attempt without committing (cancellation or lost lease).
    pub fn abandon(&self, lease: StageLease) -> OrchestratorResult<()> {
        let StageLease { ticket, grant, .. } = lease;
        self.discard(&ticket.workspace);
        self.release(&grant);
        info!(job_id = %ticket.job_id, stage = %ticket.stage, "stage attempt abandoned");
        self.settle_cancellation(ticket.job_id)?;
        Ok(())
    }

    /// Convert an attempt whose holder went silent into an explicit
    /// `Timeout` failure.
    ///
    /// The edit is made under the stage lock, which is only acquirable once
    /// the holder's lease has lapsed. A live holder enforces its own hard
    /// limit at checkpoint. Returns `false` while the attempt is still live.
    pub fn expire_attempt(&self, job_id: JobId, actor: Actor) -> OrchestratorResult<bool> {
        let Some(job) = self.store.get(job_id)? else {
            return Ok(false);
        };
        let Some(active) = job.active_attempt().cloned() else {
            return Ok(false);
        };
        let state = job.state();
        if state != active.stage.state() {
            return Ok(false);
        }
        if attempt_is_live(self.locks.as_ref(), &job)? {
            let limit = chrono::Duration::from_std(self.settings.stage_timeout(active.stage))
                .unwrap_or(chrono::Duration::MAX);
            if active.started_at.checked_add_signed(limit).is_some_and(|deadline| deadline < Utc::now()) {
                debug!(job_id = %job_id, stage = %active.stage, worker = %active.worker, "live attempt is past its hard limit");
            }
            return Ok(false);
        }

        let retry = self.settings.retry.clone();
        let message = format!("lease lapsed without commit (worker {}, fence {})", active.worker, active.fence);
        let edited = self.locked_edit(job_id, state, |job| {
            if job.active_attempt().map(|a| a.fence) != Some(active.fence) {
                return Ok(false);
            }
            job.fail(JobError::timeout(message), &retry, actor, Utc::now())?;
            Ok(true)
        })?;
        let Some((before, after)) = edited else {
            return Ok(false);
        };

        let span = job_span(&job_id, &after.trace_id());
        let _entered = span.enter();
        warn!(stage = %active.stage, attempt = active.attempt, "attempt timed out");
        self.discard(&self.handoff.workspace_path(job_id, active.stage, active.fence));
        self.announce_failure(&before, &after);
        Ok(true)
    }

    /// Record an operator-attention note on a job, under its state lock.
    ///
    /// `false` if the same note is already set or the lock is busy; a busy
    /// lock means a holder is making progress.
    pub fn flag_attention(&self, job_id: JobId, reason: &str, actor: Actor) -> OrchestratorResult<bool> {
        let Some(job) = self.store.get(job_id)? else {
            return Ok(false);
        };
        let edited = self.locked_edit(job_id, job.state(), |job| {
            Ok(job.flag_attention(reason.to_string(), actor, Utc::now()))
        })?;
        let Some((_, job)) = edited else {
            return Ok(false);
        };
        warn!(job_id = %job_id, trace_id = %job.trace_id(), state = %job.state(), reason = %reason, "job flagged for operator attention");
        self.events.emit(PipelineEvent::for_job(
            &job,
            PipelineEventKind::AttentionFlagged {
                reason: reason.to_string(),
            },
        ));
        Ok(true)
    }

    // ---- operator edges --------------------------------------------------

    /// Operator retry: `failed → queued` within the ceiling, or
    /// `failed-terminal → queued` with `override_ceiling`.
    pub fn operator_retry(&self, job_id: JobId, override_ceiling: bool) -> OrchestratorResult<JobState> {
        let job = self.store.get(job_id)?.ok_or(OrchestratorError::NotFound(job_id))?;
        let state = job.state();
        if state == JobState::FailedTerminal && !override_ceiling {
            return Err(DomainError::precondition("failed-terminal jobs need an override to retry").into());
        }
        let retry = self.settings.retry.clone();
        let retried = self.with_state_lock(job_id, state, |job| {
            job.retry(&retry, Actor::Operator, Utc::now())?;
            Ok(true)
        })?;
        if !retried {
            return Err(DomainError::conflict(format!("job {job_id} changed while retrying")).into());
        }
        Ok(JobState::Queued)
    }

    /// `* → cancelling`, then `failed-terminal` or `deleted`.
    pub fn cancel(&self, job_id: JobId, purge: bool) -> OrchestratorResult<JobState> {
        let mut job = self.store.get(job_id)?.ok_or(OrchestratorError::NotFound(job_id))?;
        let span = job_span(&job.job_id(), &job.trace_id());
        let _entered = span.enter();

        if job.state() != JobState::Cancelling {
            let before = job.clone();
            job.transition(JobState::Cancelling, Actor::Operator, Utc::now())?;
            self.store.save(&mut job, ExpectedRevision::Exact(before.revision()))?;
            info!(from = %before.state(), purge, "cancellation requested");
            self.events
                .emit(PipelineEvent::for_job(&job, PipelineEventKind::CancelRequested));
            self.announce(&before, &job);
        }

        if purge {
            self.purge(job_id)?;
            return Ok(JobState::Deleted);
        }
        self.settle_cancellation(job_id)?;
        Ok(self
            .store
            .get(job_id)?
            .map(|j| j.state())
            .unwrap_or(JobState::Deleted))
    }

    /// Finish a `cancelling` job once no worker holds its in-flight stage.
    pub fn settle_cancellation(&self, job_id: JobId) -> OrchestratorResult<bool> {
        let Some(mut job) = self.store.get(job_id)? else {
            return Ok(false);
        };
        if job.state() != JobState::Cancelling {
            return Ok(false);
        }
        if attempt_is_live(self.locks.as_ref(), &job)? {
            return Ok(false);
        }
        let before = job.clone();
        job.transition(JobState::FailedTerminal, Actor::Router, Utc::now())?;
        self.store.save(&mut job, ExpectedRevision::Exact(before.revision()))?;
        info!(job_id = %job_id, "cancellation settled");
        self.announce(&before, &job);
        Ok(true)
    }

    /// Cascading delete: record, history, every owned artifact and the intake
    /// source, so the job cannot be registered again from the same file.
    pub fn purge(&self, job_id: JobId) -> OrchestratorResult<()> {
        let Some(mut job) = self.store.get(job_id)? else {
            return Err(OrchestratorError::NotFound(job_id));
        };
        if job.state() != JobState::Deleted {
            let before = job.clone();
            job.transition(JobState::Deleted, Actor::Operator, Utc::now())?;
            self.store.save(&mut job, ExpectedRevision::Exact(before.revision()))?;
            self.announce(&before, &job);
        }
        self.handoff.purge_job(job_id)?;
        self.handoff.remove_source(job.source_reference())?;
        self.store.purge(job_id)?;
        info!(job_id = %job_id, trace_id = %job.trace_id(), "job purged");
        self.events
            .emit(PipelineEvent::for_job(&job, PipelineEventKind::JobDeleted));
        Ok(())
    }

    // ---- helpers ---------------------------------------------------------

    fn discard(&self, path: &Path) {
        if let Err(err) = self.handoff.discard(path) {
            warn!(path = %path.display(), error = %err, "failed to discard attempt output");
        }
    }

    fn release(&self, grant: &LeaseGrant) {
        if let Err(err) = self.locks.release(grant) {
            warn!(key = %grant.key, error = %err, "failed to release lease");
        }
    }

    fn announce(&self, before: &Job, after: &Job) {
        if before.state() != after.state() {
            self.events.emit(PipelineEvent::for_job(
                after,
                PipelineEventKind::StateChanged {
                    from: before.state(),
                    to: after.state(),
                },
            ));
        }
    }

    fn announce_failure(&self, before: &Job, after: &Job) {
        let terminal = after.state() == JobState::FailedTerminal;
        if let Some(error) = after.last_error() {
            self.events.emit(PipelineEvent::for_job(
                after,
                PipelineEventKind::JobFailed {
                    error_kind: error.kind,
                    terminal,
                },
            ));
        }
        if let Some(not_before) = after.retry_at() {
            self.events
                .emit(PipelineEvent::for_job(after, PipelineEventKind::RetryScheduled { not_before }));
        }
        self.announce(before, after);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use im2_core::{ErrorKind, OwnerId};
    use im2_events::{EventBus, InMemoryEventBus};

    use super::*;
    use crate::locks::InMemoryLockManager;
    use crate::store::InMemoryJobStore;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<InMemoryJobStore>,
        bus: Arc<InMemoryEventBus<PipelineEvent>>,
        router: StageRouter,
    }

    fn fixture(policy: RetryPolicy) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryJobStore::arc();
        let bus = Arc::new(InMemoryEventBus::<PipelineEvent>::new());
        let router = StageRouter::new(
            store.clone(),
            Arc::new(InMemoryLockManager::new()),
            Arc::new(PauseGate::new()),
            HandoffArea::new(dir.path().join("staging"), dir.path().join("output")),
            bus.clone(),
            RouterSettings::new(Duration::from_secs(30), Duration::from_secs(1), policy),
        );
        Fixture {
            dir,
            store,
            bus,
            router,
        }
    }

    fn register(store: &InMemoryJobStore, name: &str) -> JobId {
        let job = Job::register(
            OwnerId::parse("owner-42").unwrap(),
            PathBuf::from(format!("/intake/owner-42/b/{name}")),
            "b",
            1,
            Utc::now(),
        );
        store.insert_if_absent(job).unwrap().job().job_id()
    }

    fn worker() -> WorkerId {
        WorkerId::parse("w-test").unwrap()
    }

    fn classified() -> StageSuccess {
        StageSuccess {
            classification: Some(Classification::new("wav").with_engine("demucs")),
        }
    }

    fn write_output(lease: &StageLease) {
        fs::write(lease.ticket().workspace.join("out.bin"), b"x").unwrap();
    }

    #[test]
    fn categorizing_commit_requires_valid_classification() {
        let f = fixture(RetryPolicy::fixed(3, Duration::ZERO));
        let id = register(&f.store, "a.wav");
        assert!(f.router.admit(id).unwrap());
        assert!(!f.router.admit(id).unwrap());

        let lease = f.router.claim(Stage::Categorizing, &worker()).unwrap().unwrap();
        assert_eq!(lease.ticket().config.engine, AUTO_ENGINE);
        let rejected = f
            .router
            .complete(
                lease,
                StageSuccess {
                    classification: Some(Classification::new("txt").invalid()),
                },
            )
            .unwrap();
        assert_eq!(rejected, Committed::Rejected(FailureDisposition::Terminal));

        let job = f.store.get(id).unwrap().unwrap();
        assert_eq!(job.state(), JobState::FailedTerminal);
        assert_eq!(job.last_error().unwrap().kind, ErrorKind::Validation);
    }

    #[test]
    fn full_pipeline_advances_with_one_output_per_stage() {
        let f = fixture(RetryPolicy::fixed(3, Duration::ZERO));
        let id = register(&f.store, "a.wav");
        let sub = f.bus.subscribe();

        f.router.admit(id).unwrap();
        let lease = f.router.claim(Stage::Categorizing, &worker()).unwrap().unwrap();
        assert_eq!(f.router.complete(lease, classified()).unwrap(), Committed::Advanced(JobState::Queued));
        assert!(f.router.dispatch(id).unwrap());

        for stage in [Stage::Staging, Stage::Separating, Stage::Reconstructing, Stage::Organizing] {
            let lease = f.router.claim(stage, &worker()).unwrap().unwrap();
            assert_eq!(lease.ticket().config.engine, "demucs");
            write_output(&lease);
            f.router.complete(lease, StageSuccess::default()).unwrap();
        }

        let job = f.store.get(id).unwrap().unwrap();
        assert_eq!(job.state(), JobState::Completed);
        assert_eq!(job.output_references().len(), 4);
        assert!(job.output_references().values().all(|o| o.location.join("out.bin").is_file()));
        assert!(
            sub.drain()
                .iter()
                .any(|e| e.kind == PipelineEventKind::StateChanged { from: JobState::Organizing, to: JobState::Completed })
        );
    }

    #[test]
    fn paused_router_grants_nothing() {
        let f = fixture(RetryPolicy::default());
        let id = register(&f.store, "a.wav");
        f.router.pause_gate().pause();
        assert!(!f.router.admit(id).unwrap());
        f.router.pause_gate().resume();
        assert!(f.router.admit(id).unwrap());
        f.router.pause_gate().pause();
        assert!(f.router.claim(Stage::Categorizing, &worker()).unwrap().is_none());
    }

    #[test]
    fn transient_failure_schedules_retry_then_requeues() {
        let f = fixture(RetryPolicy::fixed(2, Duration::ZERO));
        let id = register(&f.store, "a.wav");
        f.router.admit(id).unwrap();
        let lease = f.router.claim(Stage::Categorizing, &worker()).unwrap().unwrap();
        f.router.complete(lease, classified()).unwrap();
        f.router.dispatch(id).unwrap();

        let lease = f.router.claim(Stage::Staging, &worker()).unwrap().unwrap();
        let workspace = lease.ticket().workspace.clone();
        let disposition = f.router.fail(lease, JobError::transient("disk full")).unwrap();
        assert!(matches!(disposition, FailureDisposition::RetryScheduled { .. }));
        assert!(!workspace.exists());

        assert!(f.router.requeue_if_due(id).unwrap());
        let job = f.store.get(id).unwrap().unwrap();
        assert_eq!(job.state(), JobState::Queued);
        assert_eq!(job.attempts(JobState::Staging), 1);
    }

    #[test]
    fn cancel_is_observed_at_checkpoint() {
        let f = fixture(RetryPolicy::default());
        let id = register(&f.store, "a.wav");
        f.router.admit(id).unwrap();
        let lease = f.router.claim(Stage::Categorizing, &worker()).unwrap().unwrap();
        assert_eq!(f.router.checkpoint(&lease).unwrap(), Checkpoint::Continue);

        // Worker still holds the lease: cancellation waits for it.
        assert_eq!(f.router.cancel(id, false).unwrap(), JobState::Cancelling);
        assert_eq!(f.router.checkpoint(&lease).unwrap(), Checkpoint::Cancelled);

        f.router.abandon(lease).unwrap();
        assert_eq!(f.store.get(id).unwrap().unwrap().state(), JobState::FailedTerminal);
    }

    #[test]
    fn cancel_with_purge_removes_everything() {
        let f = fixture(RetryPolicy::default());
        let id = register(&f.store, "a.wav");
        assert_eq!(f.router.cancel(id, true).unwrap(), JobState::Deleted);
        assert!(f.store.get(id).unwrap().is_none());
        assert!(f.store.find_by_source(Path::new("/intake/owner-42/b/a.wav")).unwrap().is_none());
    }

    #[test]
    fn purge_removes_outputs_workspaces_and_source_from_disk() {
        let f = fixture(RetryPolicy::default());
        let source = f.dir.path().join("intake/owner-42/b/a.wav");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"RIFF").unwrap();
        let job = Job::register(OwnerId::parse("owner-42").unwrap(), source.clone(), "b", 1, Utc::now());
        let id = f.store.insert_if_absent(job).unwrap().job().job_id();

        f.router.admit(id).unwrap();
        let lease = f.router.claim(Stage::Categorizing, &worker()).unwrap().unwrap();
        f.router.complete(lease, classified()).unwrap();
        f.router.dispatch(id).unwrap();
        let lease = f.router.claim(Stage::Staging, &worker()).unwrap().unwrap();
        write_output(&lease);
        f.router.complete(lease, StageSuccess::default()).unwrap();
        let published = f.store.get(id).unwrap().unwrap().output_references()[&Stage::Staging]
            .location
            .clone();

        // A separating attempt is mid-flight when the operator deletes.
        let in_flight = f.router.claim(Stage::Separating, &worker()).unwrap().unwrap();
        write_output(&in_flight);
        let workspace = in_flight.ticket().workspace.clone();

        assert_eq!(f.router.cancel(id, true).unwrap(), JobState::Deleted);
        assert!(!published.exists());
        assert!(!workspace.exists());
        assert!(!f.dir.path().join("output").join(id.to_string()).exists());
        assert!(!f.dir.path().join("staging").join(id.to_string()).exists());
        assert!(!source.exists());

        assert!(f.router.complete(in_flight, StageSuccess::default()).is_err());
        assert!(f.store.get(id).unwrap().is_none());
    }

    #[test]
    fn operator_retry_needs_override_after_terminal() {
        let f = fixture(RetryPolicy::fixed(1, Duration::ZERO));
        let id = register(&f.store, "a.wav");
        f.router.admit(id).unwrap();
        let lease = f.router.claim(Stage::Categorizing, &worker()).unwrap().unwrap();
        assert_eq!(
            f.router.fail(lease, JobError::transient("flaky")).unwrap(),
            FailureDisposition::Terminal
        );

        assert!(f.router.operator_retry(id, false).is_err());
        assert_eq!(f.router.operator_retry(id, true).unwrap(), JobState::Queued);
        let job = f.store.get(id).unwrap().unwrap();
        assert_eq!(job.attempts(JobState::Categorizing), 0);
    }
}
