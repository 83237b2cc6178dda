//! Low-frequency background loops: intake detection, routing, recovery sweeps.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use im2_core::{JobState, OwnerId};
use im2_events::{PipelineEvent, PipelineEventKind};

use crate::detector::{IntakeWatcher, StabilityDetector};
use crate::publish::EventSink;
use crate::registrar::{JobRegistrar, RegistrationOutcome};
use crate::router::StageRouter;
use crate::store::JobFilter;
use crate::sweeper::RecoverySweeper;
use crate::workers::WorkerHandle;

fn spawn_loop(name: &str, interval: Duration, mut tick: impl FnMut() + Send + 'static) -> WorkerHandle {
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let thread_name = name.to_string();
    let join = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            info!(worker = %thread_name, "background loop started");
            loop {
                tick();
                match shutdown_rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                }
            }
            info!(worker = %thread_name, "background loop stopped");
        })
        .expect("failed to spawn background loop thread");
    WorkerHandle::new(name.to_string(), shutdown_tx, join)
}

/// Feed watcher events into the detector and register what it confirms.
pub fn spawn_detector_loop(
    watcher: IntakeWatcher,
    detector: Arc<Mutex<StabilityDetector>>,
    registrar: Arc<JobRegistrar>,
    events: Arc<dyn EventSink>,
    interval: Duration,
) -> WorkerHandle {
    spawn_loop("intake-detector", interval, move || {
        let output = {
            let Ok(mut detector) = detector.lock() else {
                error!("detector lock poisoned");
                return;
            };
            for change in watcher.drain() {
                detector.observe(change);
            }
            detector.poll()
        };

        for arrival in &output.arrivals {
            match registrar.register(arrival) {
                Ok(reg) if reg.outcome == RegistrationOutcome::Duplicate => {
                    debug!(job_id = %reg.job_id, "arrival already registered");
                }
                Ok(_) => {}
                // The next sweep's rescan re-emits files without a record.
                Err(err) => warn!(source = %arrival.source_path.display(), error = %err, "registration failed"),
            }
        }

        if output.quarantined.is_empty() {
            return;
        }
        let intake_root = match detector.lock() {
            Ok(d) => d.settings().intake_root.clone(),
            Err(_) => return,
        };
        for record in output.quarantined {
            let mut event = PipelineEvent::system(PipelineEventKind::Quarantined {
                reason: record.reason.clone(),
            });
            if let Some(owner) = record.owner_hint(&intake_root).and_then(|o| OwnerId::parse(o).ok()) {
                event = event.with_owner(owner);
            }
            events.emit(event);
        }
    })
}

/// Admit registered jobs, dispatch queued ones and requeue due retries.
pub fn spawn_router_loop(router: Arc<StageRouter>, interval: Duration) -> WorkerHandle {
    spawn_loop("stage-router", interval, move || {
        let now = Utc::now();
        match router.store().list(&JobFilter::in_state(JobState::Failed)) {
            Ok(failed) => {
                for job in failed.iter().filter(|j| j.retry_due(now)) {
                    if let Err(err) = router.requeue_if_due(job.job_id()) {
                        warn!(job_id = %job.job_id(), error = %err, "failed to requeue job");
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to list retryable jobs"),
        }
        if let Err(err) = router.drive_pending() {
            warn!(error = %err, "failed to drive pending jobs");
        }
    })
}

pub fn spawn_sweeper_loop(sweeper: Arc<RecoverySweeper>) -> WorkerHandle {
    let interval = sweeper.settings().interval;
    spawn_loop("recovery-sweeper", interval, move || {
        sweeper.run_once();
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Instant;

    use im2_core::RetryPolicy;
    use im2_events::{EventBus, InMemoryEventBus};

    use super::*;
    use crate::detector::DetectorSettings;
    use crate::handoff::HandoffArea;
    use crate::locks::InMemoryLockManager;
    use crate::pause::PauseGate;
    use crate::router::RouterSettings;
    use crate::store::{InMemoryJobStore, JobStore};

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn detector_loop_registers_renamed_arrivals() {
        let dir = tempfile::tempdir().unwrap();
        let intake = dir.path().join("intake");
        fs::create_dir_all(intake.join("owner-42/batch-1")).unwrap();

        let store = InMemoryJobStore::arc();
        let bus = Arc::new(InMemoryEventBus::<PipelineEvent>::new());
        let sub = bus.subscribe();
        let registrar = Arc::new(JobRegistrar::new(store.clone(), bus.clone()));
        let mut settings = DetectorSettings::new(&intake, dir.path().join("quarantine"));
        settings.quiescence = Duration::from_millis(50);
        let detector = Arc::new(Mutex::new(StabilityDetector::new(settings)));

        let watcher = IntakeWatcher::start(&intake).unwrap();
        let handle = spawn_detector_loop(watcher, detector, registrar, bus.clone(), Duration::from_millis(20));

        let tmp = dir.path().join("upload.part");
        fs::write(&tmp, b"RIFF....WAVE").unwrap();
        fs::rename(&tmp, intake.join("owner-42/batch-1/track.wav")).unwrap();

        assert!(wait_until(|| store.list(&JobFilter::all()).unwrap().len() == 1));
        handle.shutdown();

        let job = store.list(&JobFilter::all()).unwrap().remove(0);
        assert_eq!(job.owner_id().as_str(), "owner-42");
        assert_eq!(job.batch_marker(), "batch-1");
        assert!(
            sub.drain()
                .iter()
                .any(|e| e.kind == PipelineEventKind::JobRegistered)
        );
    }

    #[test]
    fn router_loop_admits_registered_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryJobStore::arc();
        let router = Arc::new(StageRouter::new(
            store.clone(),
            Arc::new(InMemoryLockManager::new()),
            Arc::new(PauseGate::new()),
            HandoffArea::new(dir.path().join("staging"), dir.path().join("output")),
            Arc::new(crate::publish::NullSink),
            RouterSettings::new(Duration::from_secs(30), Duration::from_secs(1), RetryPolicy::default()),
        ));
        let job = im2_core::Job::register(
            OwnerId::parse("o").unwrap(),
            dir.path().join("a.wav"),
            "b",
            1,
            Utc::now(),
        );
        let id = store.insert_if_absent(job).unwrap().job().job_id();

        let handle = spawn_router_loop(router, Duration::from_millis(10));
        assert!(wait_until(|| store.get(id).unwrap().unwrap().state() == JobState::Categorizing));
        assert_eq!(handle.name(), "stage-router");
        handle.shutdown();
    }
}
