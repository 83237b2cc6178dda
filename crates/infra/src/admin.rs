//! Operator interface: pause/resume, retry, cancel, delete, checkpoint, list.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use im2_core::{Job, JobId, JobState};
use im2_events::{PipelineEvent, PipelineEventKind};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::query::{JobView, PipelineQuery, PipelineStats};
use crate::router::StageRouter;
use crate::store::JobFilter;

/// Snapshot written by [`AdminService::checkpoint`].
#[derive(Debug, Serialize)]
pub struct CheckpointSnapshot<'a> {
    pub taken_at: DateTime<Utc>,
    pub stats: &'a PipelineStats,
    pub jobs: &'a [Job],
}

/// Summary of a written checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSummary {
    pub jobs: usize,
    pub taken_at: DateTime<Utc>,
}

pub struct AdminService {
    router: Arc<StageRouter>,
    query: PipelineQuery,
}

impl AdminService {
    pub fn new(router: Arc<StageRouter>, query: PipelineQuery) -> Self {
        Self { router, query }
    }

    pub fn query(&self) -> &PipelineQuery {
        &self.query
    }

    /// Stop granting new locks; in-flight work drains.
    pub fn pause(&self) -> bool {
        let changed = self.router.pause_gate().pause();
        if changed {
            info!("pipeline paused");
            self.router.events().emit(PipelineEvent::system(PipelineEventKind::Paused));
        }
        changed
    }

    pub fn resume(&self) -> bool {
        let changed = self.router.pause_gate().resume();
        if changed {
            info!("pipeline resumed");
            self.router.events().emit(PipelineEvent::system(PipelineEventKind::Resumed));
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        self.router.pause_gate().is_paused()
    }

    pub fn retry(&self, job_id: JobId, override_ceiling: bool) -> OrchestratorResult<JobState> {
        info!(job_id = %job_id, override_ceiling, "operator retry");
        self.router.operator_retry(job_id, override_ceiling)
    }

    pub fn cancel(&self, job_id: JobId, purge: bool) -> OrchestratorResult<JobState> {
        self.router.cancel(job_id, purge)
    }

    /// Cascading right-to-delete from any state.
    pub fn delete(&self, job_id: JobId) -> OrchestratorResult<()> {
        info!(job_id = %job_id, "operator delete");
        self.router.purge(job_id)
    }

    pub fn list(&self, filter: &JobFilter) -> OrchestratorResult<Vec<JobView>> {
        Ok(self.query.list(filter)?)
    }

    /// Write every job plus aggregate stats to `path` atomically.
    pub fn checkpoint(&self, path: &Path) -> OrchestratorResult<CheckpointSummary> {
        let jobs = self.router.store().list(&JobFilter::all())?;
        let stats = self.query.stats()?;
        let taken_at = Utc::now();
        let snapshot = CheckpointSnapshot {
            taken_at,
            stats: &stats,
            jobs: &jobs,
        };
        let body = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| OrchestratorError::Checkpoint(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| checkpoint_io(parent, e))?;
        }
        let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = path.with_file_name(tmp_name);
        fs::write(&tmp, body).map_err(|e| checkpoint_io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| checkpoint_io(path, e))?;

        info!(path = %path.display(), jobs = jobs.len(), "checkpoint written");
        Ok(CheckpointSummary {
            jobs: jobs.len(),
            taken_at,
        })
    }
}

fn checkpoint_io(path: &Path, err: std::io::Error) -> OrchestratorError {
    OrchestratorError::Checkpoint(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use im2_core::{FencingToken, OwnerId, RetryPolicy, Stage};
    use im2_events::{EventBus, InMemoryEventBus};

    use super::*;
    use crate::handoff::HandoffArea;
    use crate::locks::InMemoryLockManager;
    use crate::pause::PauseGate;
    use crate::router::RouterSettings;
    use crate::store::{InMemoryJobStore, JobStore};

    fn admin(dir: &Path) -> (Arc<InMemoryJobStore>, Arc<InMemoryEventBus<PipelineEvent>>, AdminService) {
        let store = InMemoryJobStore::arc();
        let bus = Arc::new(InMemoryEventBus::<PipelineEvent>::new());
        let pause = Arc::new(PauseGate::new());
        let router = Arc::new(StageRouter::new(
            store.clone(),
            Arc::new(InMemoryLockManager::new()),
            pause.clone(),
            HandoffArea::new(dir.join("staging"), dir.join("output")),
            bus.clone(),
            RouterSettings::new(Duration::from_secs(30), Duration::from_secs(1), RetryPolicy::default()),
        ));
        let query = PipelineQuery::new(store.clone(), pause, Duration::from_secs(3600));
        (store, bus, AdminService::new(router, query))
    }

    fn seed(store: &InMemoryJobStore, name: &str) -> JobId {
        let job = Job::register(
            OwnerId::parse("owner-42").unwrap(),
            PathBuf::from(format!("/in/owner-42/b/{name}")),
            "b",
            1,
            Utc::now(),
        );
        store.insert_if_absent(job).unwrap().job().job_id()
    }

    #[test]
    fn pause_and_resume_publish_once() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, bus, admin) = admin(dir.path());
        let sub = bus.subscribe();

        assert!(admin.pause());
        assert!(!admin.pause());
        assert!(admin.query().stats().unwrap().paused);
        assert!(admin.resume());

        let kinds: Vec<_> = sub.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![PipelineEventKind::Paused, PipelineEventKind::Resumed]);
    }

    #[test]
    fn checkpoint_writes_complete_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _bus, admin) = admin(dir.path());
        seed(&store, "a.wav");
        seed(&store, "b.wav");

        let path = dir.path().join("snapshots/state.json");
        let summary = admin.checkpoint(&path).unwrap();
        assert_eq!(summary.jobs, 2);

        let json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["jobs"].as_array().unwrap().len(), 2);
        assert_eq!(json["stats"]["total"], 2);
        assert!(!dir.path().join("snapshots/state.json.tmp").exists());
    }

    #[test]
    fn delete_cascades_and_list_filters() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _bus, admin) = admin(dir.path());
        let source = dir.path().join("intake/owner-42/b/a.wav");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"RIFF").unwrap();
        let a = store
            .insert_if_absent(Job::register(OwnerId::parse("owner-42").unwrap(), source.clone(), "b", 1, Utc::now()))
            .unwrap()
            .job()
            .job_id();
        seed(&store, "b.wav");

        let area = HandoffArea::new(dir.path().join("staging"), dir.path().join("output"));
        let published = area.prepare(a, Stage::Staging, FencingToken::new(1)).unwrap();
        fs::write(published.join("mix.wav"), b"x").unwrap();
        let published = area.publish(a, Stage::Staging, FencingToken::new(1)).unwrap().location;
        let staged = area.prepare(a, Stage::Separating, FencingToken::new(2)).unwrap();

        admin.delete(a).unwrap();
        assert!(store.get(a).unwrap().is_none());
        assert!(!published.exists());
        assert!(!staged.exists());
        assert!(!source.exists());
        assert!(matches!(admin.delete(a), Err(OrchestratorError::NotFound(_))));

        let listed = admin
            .list(&JobFilter::in_state(JobState::Registered).owned_by(OwnerId::parse("owner-42").unwrap()))
            .unwrap();
        assert_eq!(listed.len(), 1);
    }
}
