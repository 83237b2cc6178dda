//! Stage executor: claims attempts for one working stage and supervises them.
//!
//! The handler runs on its own thread. The supervising thread renews the
//! lease (every third of the lease), polls the cancellation/timeout
//! checkpoint, and commits or fails the attempt through the router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use im2_core::{FailureDisposition, JobError, JobId, Stage, WorkerId};

use crate::error::OrchestratorResult;
use crate::router::{Checkpoint, Committed, StageLease, StageRouter, StageSuccess, StageTicket};

/// Stage-specific work. Implementations write their output into
/// `ticket.workspace` and poll `control` at safe points.
pub trait StageWorker: Send + Sync {
    fn run(&self, ticket: &StageTicket, control: &AttemptControl) -> Result<StageSuccess, JobError>;
}

impl<F> StageWorker for F
where
    F: Fn(&StageTicket, &AttemptControl) -> Result<StageSuccess, JobError> + Send + Sync,
{
    fn run(&self, ticket: &StageTicket, control: &AttemptControl) -> Result<StageSuccess, JobError> {
        self(ticket, control)
    }
}

/// Stop signal shared between the supervisor and the handler.
#[derive(Debug, Clone, Default)]
pub struct AttemptControl {
    stop: Arc<AtomicBool>,
}

impl AttemptControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once the handler should abort (cancel, lost lease, hard limit).
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct StageExecutorConfig {
    pub stage: Stage,
    pub name: String,
    pub worker_id: WorkerId,
    /// How often to poll for claimable jobs.
    pub poll_interval: Duration,
    /// How long a stopped handler gets to return before it is left behind.
    pub stop_grace: Duration,
}

impl StageExecutorConfig {
    pub fn new(stage: Stage) -> Self {
        let name = format!("stage-{stage}");
        Self {
            stage,
            worker_id: WorkerId::generate(&name),
            name,
            poll_interval: Duration::from_millis(250),
            stop_grace: Duration::from_secs(5),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub attempts_started: u64,
    pub committed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub abandoned: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// How a supervised attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Committed { job_id: JobId, result: Committed },
    Failed { job_id: JobId, disposition: FailureDisposition },
    TimedOut { job_id: JobId, disposition: FailureDisposition },
    /// Cancelled, or the lease was lost; nothing was committed.
    Abandoned { job_id: JobId },
    /// The commit itself was rejected (stale fence, revision race).
    Rejected { job_id: JobId, reason: String },
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct StageExecutorHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl StageExecutorHandle {
    /// Request graceful shutdown. The attempt in progress finishes first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

enum Verdict {
    Finished(Result<StageSuccess, JobError>),
    TimedOut,
    Stopped,
}

pub struct StageExecutor {
    router: Arc<StageRouter>,
    handler: Arc<dyn StageWorker>,
    config: StageExecutorConfig,
}

impl StageExecutor {
    pub fn new(router: Arc<StageRouter>, handler: Arc<dyn StageWorker>, config: StageExecutorConfig) -> Self {
        Self {
            router,
            handler,
            config,
        }
    }

    pub fn spawn(self) -> StageExecutorHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(ExecutorStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || self.run_loop(shutdown_rx, stats_clone))
            .expect("failed to spawn stage executor thread");

        StageExecutorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    fn run_loop(self, shutdown_rx: mpsc::Receiver<()>, stats: Arc<Mutex<ExecutorStats>>) {
        let cfg = &self.config;
        info!(executor = %cfg.name, stage = %cfg.stage, worker = %cfg.worker_id, "stage executor started");
        let started = Instant::now();

        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            update(&stats, |s| s.uptime_secs = started.elapsed().as_secs());

            match self.router.claim(cfg.stage, &cfg.worker_id) {
                Ok(Some(lease)) => {
                    update(&stats, |s| {
                        s.attempts_started += 1;
                        s.current_running += 1;
                    });
                    let outcome = self.supervise(lease);
                    update(&stats, |s| {
                        s.current_running = s.current_running.saturating_sub(1);
                        match &outcome {
                            Ok(AttemptOutcome::Committed { .. }) => s.committed += 1,
                            Ok(AttemptOutcome::Failed { .. }) => s.failed += 1,
                            Ok(AttemptOutcome::TimedOut { .. }) => s.timed_out += 1,
                            Ok(AttemptOutcome::Abandoned { .. }) | Ok(AttemptOutcome::Rejected { .. }) => {
                                s.abandoned += 1
                            }
                            Err(_) => s.failed += 1,
                        }
                    });
                    if let Err(err) = outcome {
                        error!(executor = %cfg.name, error = %err, "attempt supervision failed");
                    }
                }
                Ok(None) => {
                    if shutdown_rx.recv_timeout(cfg.poll_interval).is_ok() {
                        break;
                    }
                }
                Err(err) => {
                    error!(executor = %cfg.name, error = %err, "failed to claim work");
                    if shutdown_rx.recv_timeout(cfg.poll_interval).is_ok() {
                        break;
                    }
                }
            }
        }

        info!(executor = %cfg.name, "stage executor stopped");
    }

    /// Claim and run a single attempt on the calling thread.
    pub fn run_one(&self) -> OrchestratorResult<Option<AttemptOutcome>> {
        match self.router.claim(self.config.stage, &self.config.worker_id)? {
            Some(lease) => self.supervise(lease).map(Some),
            None => Ok(None),
        }
    }

    fn supervise(&self, mut lease: StageLease) -> OrchestratorResult<AttemptOutcome> {
        let ticket = lease.ticket().clone();
        let job_id = ticket.job_id;
        let control = AttemptControl::new();
        let (done_tx, done_rx) = mpsc::channel();

        let handler = self.handler.clone();
        let handler_ticket = ticket.clone();
        let handler_control = control.clone();
        thread::Builder::new()
            .name(format!("{}-attempt", self.config.name))
            .spawn(move || {
                let result = handler.run(&handler_ticket, &handler_control);
                let _ = done_tx.send(result);
            })
            .expect("failed to spawn stage handler thread");

        let beat = (self.router.settings().lease / 3).max(Duration::from_millis(10));
        let verdict = loop {
            match done_rx.recv_timeout(beat) {
                Ok(result) => break Verdict::Finished(result),
                Err(RecvTimeoutError::Disconnected) => {
                    break Verdict::Finished(Err(JobError::transient("stage handler panicked")));
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            if let Err(err) = self.router.heartbeat(&mut lease) {
                warn!(job_id = %job_id, error = %err, "lease renewal failed");
                control.stop();
                break Verdict::Stopped;
            }
            match self.router.checkpoint(&lease) {
                Ok(Checkpoint::Continue) => {}
                Ok(Checkpoint::TimedOut) => {
                    control.stop();
                    break Verdict::TimedOut;
                }
                Ok(Checkpoint::Cancelled) | Ok(Checkpoint::LeaseLost) => {
                    control.stop();
                    break Verdict::Stopped;
                }
                Err(err) => debug!(job_id = %job_id, error = %err, "checkpoint unavailable; continuing"),
            }
        };

        if !matches!(verdict, Verdict::Finished(_)) {
            // Give the handler a chance to tear down (kill its child, etc.).
            let _ = done_rx.recv_timeout(self.config.stop_grace);
        }

        match verdict {
            Verdict::Finished(Ok(success)) => match self.router.complete(lease, success) {
                Ok(result) => Ok(AttemptOutcome::Committed { job_id, result }),
                Err(err) if err.is_conflict() => Ok(AttemptOutcome::Rejected {
                    job_id,
                    reason: err.to_string(),
                }),
                Err(err) => Err(err),
            },
            Verdict::Finished(Err(error)) => match self.router.fail(lease, error) {
                Ok(disposition) => Ok(AttemptOutcome::Failed { job_id, disposition }),
                Err(err) if err.is_conflict() => {
                    // The job moved on (cancelled or re-leased); drop quietly.
                    self.router.settle_cancellation(job_id)?;
                    Ok(AttemptOutcome::Abandoned { job_id })
                }
                Err(err) => Err(err),
            },
            Verdict::TimedOut => {
                let limit = ticket.config.hard_limit;
                let error = JobError::timeout(format!("{} exceeded its hard limit of {limit:?}", ticket.stage));
                let disposition = self.router.fail(lease, error)?;
                Ok(AttemptOutcome::TimedOut { job_id, disposition })
            }
            Verdict::Stopped => {
                self.router.abandon(lease)?;
                Ok(AttemptOutcome::Abandoned { job_id })
            }
        }
    }
}

fn update(stats: &Mutex<ExecutorStats>, f: impl FnOnce(&mut ExecutorStats)) {
    if let Ok(mut s) = stats.lock() {
        f(&mut s);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use chrono::Utc;
    use im2_core::{Classification, Job, JobState, OwnerId, RetryPolicy};

    use super::*;
    use crate::handoff::HandoffArea;
    use crate::locks::InMemoryLockManager;
    use crate::pause::PauseGate;
    use crate::publish::NullSink;
    use crate::router::RouterSettings;
    use crate::store::{InMemoryJobStore, JobStore};

    fn router(dir: &std::path::Path, settings: RouterSettings) -> (Arc<InMemoryJobStore>, Arc<StageRouter>) {
        let store = InMemoryJobStore::arc();
        let router = Arc::new(StageRouter::new(
            store.clone(),
            Arc::new(InMemoryLockManager::new()),
            Arc::new(PauseGate::new()),
            HandoffArea::new(dir.join("staging"), dir.join("output")),
            Arc::new(NullSink),
            settings,
        ));
        (store, router)
    }

    fn categorizing_job(store: &InMemoryJobStore, router: &StageRouter) -> im2_core::JobId {
        let job = Job::register(
            OwnerId::parse("o").unwrap(),
            PathBuf::from("/in/o/b/a.wav"),
            "b",
            1,
            Utc::now(),
        );
        let id = store.insert_if_absent(job).unwrap().job().job_id();
        router.admit(id).unwrap();
        id
    }

    fn settings(lease: Duration, hard_limit: Duration) -> RouterSettings {
        let mut s = RouterSettings::new(lease, Duration::from_secs(1), RetryPolicy::fixed(2, Duration::ZERO));
        s.default_stage_timeout = hard_limit;
        s
    }

    #[test]
    fn closure_handler_commits() {
        let dir = tempfile::tempdir().unwrap();
        let (store, router) = router(dir.path(), settings(Duration::from_secs(30), Duration::from_secs(60)));
        let id = categorizing_job(&store, &router);

        let handler = |_t: &StageTicket, _c: &AttemptControl| -> Result<StageSuccess, JobError> {
            Ok(StageSuccess {
                classification: Some(Classification::new("wav")),
            })
        };
        let exec = StageExecutor::new(router, Arc::new(handler), StageExecutorConfig::new(Stage::Categorizing));
        let outcome = exec.run_one().unwrap().unwrap();

        assert_eq!(
            outcome,
            AttemptOutcome::Committed {
                job_id: id,
                result: Committed::Advanced(JobState::Queued)
            }
        );
        assert!(exec.run_one().unwrap().is_none());
    }

    #[test]
    fn slow_handler_is_stopped_at_hard_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (store, router) = router(dir.path(), settings(Duration::from_millis(60), Duration::from_millis(50)));
        let id = categorizing_job(&store, &router);

        let handler = |t: &StageTicket, c: &AttemptControl| -> Result<StageSuccess, JobError> {
            while !c.should_stop() {
                thread::sleep(Duration::from_millis(5));
            }
            fs::write(t.workspace.join("partial"), b"x").ok();
            Err(JobError::transient("stopped"))
        };
        let exec = StageExecutor::new(router, Arc::new(handler), StageExecutorConfig::new(Stage::Categorizing));
        let outcome = exec.run_one().unwrap().unwrap();

        assert!(matches!(
            outcome,
            AttemptOutcome::TimedOut {
                disposition: FailureDisposition::RetryScheduled { .. },
                ..
            }
        ));
        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.last_error().unwrap().kind, im2_core::ErrorKind::Timeout);
    }

    #[test]
    fn spawned_executor_drains_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let (store, router) = router(dir.path(), settings(Duration::from_secs(30), Duration::from_secs(60)));
        let id = categorizing_job(&store, &router);

        let handler = |_t: &StageTicket, _c: &AttemptControl| -> Result<StageSuccess, JobError> {
            Ok(StageSuccess {
                classification: Some(Classification::new("wav")),
            })
        };
        let handle = StageExecutor::new(
            router,
            Arc::new(handler),
            StageExecutorConfig::new(Stage::Categorizing).with_poll_interval(Duration::from_millis(10)),
        )
        .spawn();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().committed == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.stats().committed, 1);
        handle.shutdown();
        assert_eq!(store.get(id).unwrap().unwrap().state(), JobState::Queued);
    }
}
