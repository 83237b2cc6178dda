//! Recovery sweeper: reconciles leases, job records, the handoff tree and the
//! intake tree after crashes, and keeps doing so at a low frequency.
//!
//! The sweeper never creates a job for a source that already has one. A job
//! whose source vanished is flagged, not re-registered.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use im2_core::{Actor, Job, JobState};

use crate::detector::StabilityDetector;
use crate::error::OrchestratorResult;
use crate::locks::attempt_is_live;
use crate::registrar::JobRegistrar;
use crate::router::StageRouter;
use crate::store::JobFilter;

#[derive(Debug, Clone)]
pub struct SweeperSettings {
    /// Delay between periodic passes.
    pub interval: Duration,
    /// A non-terminal job untouched for this long, with no live attempt, is
    /// considered stuck.
    pub stuck_threshold: Duration,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(60 * 60),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub leases_reclaimed: usize,
    pub attempts_timed_out: usize,
    pub retries_requeued: usize,
    pub jobs_redriven: usize,
    pub cancellations_settled: usize,
    pub deletions_finished: usize,
    pub orphans_discarded: usize,
    pub attention_flagged: usize,
    pub intake_files_rescanned: usize,
    pub errors: usize,
}

pub struct RecoverySweeper {
    router: Arc<StageRouter>,
    registrar: Arc<JobRegistrar>,
    detector: Option<Arc<Mutex<StabilityDetector>>>,
    settings: SweeperSettings,
}

impl RecoverySweeper {
    pub fn new(router: Arc<StageRouter>, registrar: Arc<JobRegistrar>, settings: SweeperSettings) -> Self {
        Self {
            router,
            registrar,
            detector: None,
            settings,
        }
    }

    /// Also rescan the intake tree through `detector` on every pass.
    pub fn with_detector(mut self, detector: Arc<Mutex<StabilityDetector>>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn settings(&self) -> &SweeperSettings {
        &self.settings
    }

    /// One full reconciliation pass. Individual failures are logged and
    /// counted; the pass always runs to the end.
    pub fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();

        tally(&mut report, self.reclaim_leases(), |r, n| r.leases_reclaimed = n);
        tally(&mut report, self.time_out_attempts(), |r, n| r.attempts_timed_out = n);
        tally(&mut report, self.requeue_due_retries(), |r, n| r.retries_requeued = n);
        tally(&mut report, self.settle_cancellations(), |r, n| r.cancellations_settled = n);
        tally(&mut report, self.finish_deletions(), |r, n| r.deletions_finished = n);
        tally(&mut report, self.router.drive_pending(), |r, n| r.jobs_redriven = n);
        tally(&mut report, self.flag_problems(), |r, n| r.attention_flagged = n);
        tally(&mut report, self.discard_orphans(), |r, n| r.orphans_discarded = n);
        report.intake_files_rescanned = self.rescan_intake();

        if report != SweepReport::default() {
            info!(
                leases = report.leases_reclaimed,
                timed_out = report.attempts_timed_out,
                requeued = report.retries_requeued,
                redriven = report.jobs_redriven,
                orphans = report.orphans_discarded,
                flagged = report.attention_flagged,
                rescanned = report.intake_files_rescanned,
                errors = report.errors,
                "recovery sweep finished"
            );
        } else {
            debug!("recovery sweep found nothing to do");
        }
        report
    }

    fn reclaim_leases(&self) -> OrchestratorResult<usize> {
        let reaped = self.router.locks().reap_expired()?;
        for grant in &reaped {
            debug!(key = %grant.key, holder = %grant.holder, "expired lease reclaimed");
        }
        Ok(reaped.len())
    }

    /// Silence (a lapsed lease) and overruns become explicit `Timeout` failures.
    fn time_out_attempts(&self) -> OrchestratorResult<usize> {
        let working = JobFilter::in_states(JobState::ALL.into_iter().filter(|s| s.stage().is_some()));
        let mut count = 0;
        for job in self.router.store().list(&working)? {
            if job.active_attempt().is_none() {
                continue;
            }
            match self.router.expire_attempt(job.job_id(), Actor::Sweeper) {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(err) => warn!(job_id = %job.job_id(), error = %err, "failed to time out attempt"),
            }
        }
        Ok(count)
    }

    fn requeue_due_retries(&self) -> OrchestratorResult<usize> {
        let now = Utc::now();
        let mut count = 0;
        for job in self.router.store().list(&JobFilter::in_state(JobState::Failed))? {
            if !job.retry_due(now) {
                continue;
            }
            match self.router.requeue_if_due(job.job_id()) {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(err) => warn!(job_id = %job.job_id(), error = %err, "failed to requeue job"),
            }
        }
        Ok(count)
    }

    fn settle_cancellations(&self) -> OrchestratorResult<usize> {
        let mut count = 0;
        for job in self.router.store().list(&JobFilter::in_state(JobState::Cancelling))? {
            if self.router.settle_cancellation(job.job_id())? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// A crash between `→ deleted` and the purge leaves a record behind.
    fn finish_deletions(&self) -> OrchestratorResult<usize> {
        let mut count = 0;
        for job in self.router.store().list(&JobFilter::in_state(JobState::Deleted))? {
            self.router.purge(job.job_id())?;
            count += 1;
        }
        Ok(count)
    }

    fn flag_problems(&self) -> OrchestratorResult<usize> {
        let now = Utc::now();
        let mut count = 0;
        for job in self.router.store().list(&JobFilter::all())? {
            if job.state().is_terminal() {
                continue;
            }
            let needs_source = job
                .state()
                .stage()
                .is_none_or(|stage| stage.input_stage().is_none())
                && job.state() != JobState::Cancelling;
            let reason = if needs_source && !job.source_reference().exists() {
                Some(format!(
                    "source artifact missing: {}",
                    job.source_reference().display()
                ))
            } else if job.is_stuck(now, self.settings.stuck_threshold) && !self.attempt_is_live(&job) {
                match job.state().stage() {
                    Some(stage) if job.active_attempt().is_none() => {
                        Some(format!("no worker claimed {stage} within the stuck threshold"))
                    }
                    _ => Some(format!("stuck in {} beyond the stuck threshold", job.state())),
                }
            } else {
                None
            };
            if let Some(reason) = reason {
                if self.router.flag_attention(job.job_id(), &reason, Actor::Sweeper)? {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// A heartbeating holder keeps its lease alive without touching the record.
    fn attempt_is_live(&self, job: &Job) -> bool {
        attempt_is_live(self.router.locks().as_ref(), job).unwrap_or_else(|err| {
            debug!(job_id = %job.job_id(), error = %err, "lease lookup failed");
            false
        })
    }

    /// Remove staged or published directories no job references or is producing.
    fn discard_orphans(&self) -> OrchestratorResult<usize> {
        let grace = self.router.settings().lease;
        let mut count = 0;
        for artifact in self.router.handoff().artifacts()? {
            if younger_than(&artifact.path, grace) {
                continue;
            }
            let job = self.router.store().get(artifact.job_id)?;
            if !artifact.is_orphan(job.as_ref()) {
                continue;
            }
            match self.router.handoff().discard(&artifact.path) {
                Ok(()) => {
                    debug!(path = %artifact.path.display(), job_id = %artifact.job_id, "orphaned artifact discarded");
                    count += 1;
                }
                Err(err) => warn!(path = %artifact.path.display(), error = %err, "failed to discard orphan"),
            }
        }
        Ok(count)
    }

    fn rescan_intake(&self) -> usize {
        let Some(detector) = &self.detector else {
            return 0;
        };
        let registrar = &self.registrar;
        match detector.lock() {
            Ok(mut detector) => detector.rescan(&|path| registrar.knows(path)),
            Err(_) => {
                warn!("detector lock poisoned; skipping intake rescan");
                0
            }
        }
    }
}

fn tally(
    report: &mut SweepReport,
    result: OrchestratorResult<usize>,
    set: impl FnOnce(&mut SweepReport, usize),
) {
    match result {
        Ok(n) => set(report, n),
        Err(err) => {
            warn!(error = %err, "recovery sweep step failed");
            report.errors += 1;
        }
    }
}

fn younger_than(path: &std::path::Path, age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed < age)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use im2_core::{Classification, JobId, OwnerId, RetryPolicy, Stage, WorkerId};

    use super::*;
    use crate::handoff::HandoffArea;
    use crate::locks::InMemoryLockManager;
    use crate::pause::PauseGate;
    use crate::publish::NullSink;
    use crate::query::PipelineQuery;
    use crate::router::{Committed, RouterSettings, StageSuccess};
    use crate::store::{InMemoryJobStore, JobStore};

    fn sweeper(dir: &std::path::Path, lease: Duration) -> (Arc<InMemoryJobStore>, RecoverySweeper) {
        sweeper_with(dir, lease, SweeperSettings::default())
    }

    fn sweeper_with(
        dir: &std::path::Path,
        lease: Duration,
        settings: SweeperSettings,
    ) -> (Arc<InMemoryJobStore>, RecoverySweeper) {
        let store = InMemoryJobStore::arc();
        let router = Arc::new(StageRouter::new(
            store.clone(),
            Arc::new(InMemoryLockManager::new()),
            Arc::new(PauseGate::new()),
            HandoffArea::new(dir.join("staging"), dir.join("output")),
            Arc::new(NullSink),
            RouterSettings::new(lease, Duration::from_secs(1), RetryPolicy::fixed(3, Duration::ZERO)),
        ));
        let registrar = Arc::new(JobRegistrar::new(store.clone(), Arc::new(NullSink)));
        (store, RecoverySweeper::new(router, registrar, settings))
    }

    fn claimed_categorizing(store: &InMemoryJobStore, router: &StageRouter, source: PathBuf) -> (JobId, crate::router::StageLease) {
        let job = Job::register(OwnerId::parse("o").unwrap(), source, "b", 1, Utc::now());
        let id = store.insert_if_absent(job).unwrap().job().job_id();
        router.admit(id).unwrap();
        let lease = router
            .claim(Stage::Categorizing, &WorkerId::parse("w1").unwrap())
            .unwrap()
            .unwrap();
        (id, lease)
    }

    fn classified() -> StageSuccess {
        StageSuccess {
            classification: Some(Classification::new("wav")),
        }
    }

    #[test]
    fn missing_source_is_flagged_once_not_reregistered() {
        let dir = tempfile::tempdir().unwrap();
        let (store, sweeper) = sweeper(dir.path(), Duration::from_secs(30));
        let job = Job::register(
            OwnerId::parse("o").unwrap(),
            PathBuf::from("/definitely/not/here.wav"),
            "b",
            1,
            Utc::now(),
        );
        let id = store.insert_if_absent(job).unwrap().job().job_id();

        let first = sweeper.run_once();
        assert_eq!(first.attention_flagged, 1);
        // Admission still happened; the flag is informational.
        assert_eq!(first.jobs_redriven, 1);
        assert_eq!(sweeper.run_once().attention_flagged, 0);

        let job = store.get(id).unwrap().unwrap();
        assert!(job.attention().unwrap().contains("source artifact missing"));
        assert_eq!(store.list(&JobFilter::all()).unwrap().len(), 1);
    }

    #[test]
    fn orphaned_workspace_of_unknown_job_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, sweeper) = sweeper(dir.path(), Duration::ZERO);
        let ws = sweeper
            .router
            .handoff()
            .prepare(JobId::new(), Stage::Staging, im2_core::FencingToken::new(7))
            .unwrap();

        let report = sweeper.run_once();
        assert_eq!(report.orphans_discarded, 1);
        assert!(!ws.exists());
    }

    #[test]
    fn heartbeating_attempt_outlives_stuck_threshold_unflagged() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SweeperSettings {
            stuck_threshold: Duration::from_millis(20),
            ..SweeperSettings::default()
        };
        let (store, sweeper) = sweeper_with(dir.path(), Duration::from_secs(30), settings);
        let source = dir.path().join("track.wav");
        std::fs::write(&source, b"RIFF").unwrap();
        let (id, mut lease) = claimed_categorizing(&store, &sweeper.router, source);

        std::thread::sleep(Duration::from_millis(60));
        sweeper.router.heartbeat(&mut lease).unwrap();

        let report = sweeper.run_once();
        assert_eq!(report.attention_flagged, 0);
        assert_eq!(report.attempts_timed_out, 0);
        assert!(store.get(id).unwrap().unwrap().attention().is_none());

        let query = PipelineQuery::new(store.clone(), Arc::new(PauseGate::new()), Duration::from_millis(20))
            .with_locks(sweeper.router.locks().clone());
        assert_eq!(query.stats().unwrap().stuck, 0);

        assert_eq!(
            sweeper.router.complete(lease, classified()).unwrap(),
            Committed::Advanced(JobState::Queued)
        );
    }

    #[test]
    fn flag_waits_for_the_holder_instead_of_racing_its_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (store, sweeper) = sweeper(dir.path(), Duration::from_secs(30));
        // The source vanishes while categorizing is in flight.
        let (id, lease) = claimed_categorizing(&store, &sweeper.router, dir.path().join("gone.wav"));

        assert_eq!(sweeper.run_once().attention_flagged, 0);
        assert!(!sweeper.router.flag_attention(id, "look", Actor::Sweeper).unwrap());
        let revision = store.get(id).unwrap().unwrap().revision();

        assert_eq!(
            sweeper.router.complete(lease, classified()).unwrap(),
            Committed::Advanced(JobState::Queued)
        );
        assert_eq!(store.get(id).unwrap().unwrap().revision(), revision + 1);

        // Once the lock is free the next pass records the problem.
        assert_eq!(sweeper.run_once().attention_flagged, 1);
        let job = store.get(id).unwrap().unwrap();
        assert!(job.attention().unwrap().contains("source artifact missing"));
        assert!(job.output_references().is_empty());
    }
}
