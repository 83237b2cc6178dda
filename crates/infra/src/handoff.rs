//! Stage workspaces and atomic output publication.
//!
//! Layout (both roots must be on the same filesystem so `rename` is atomic):
//!
//! ```text
//! <staging_root>/<job_id>/<stage>.<fence>/   workspace of one attempt (private)
//! <output_root>/<job_id>/<stage>/v<fence>/   published output of one attempt
//! ```
//!
//! A published directory is only *visible* once the job record references it;
//! anything else under the output root is an orphan.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};
use walkdir::WalkDir;

use im2_core::{FencingToken, Job, JobId, OutputReference, Stage};

#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("staged output missing: {0}")]
    MissingOutput(PathBuf),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> HandoffError + '_ {
    move |source| HandoffError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where an artifact sits in the handoff tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    Staged,
    Published,
}

/// One attempt's directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub job_id: JobId,
    pub stage: Stage,
    pub fence: FencingToken,
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

impl Artifact {
    /// Whether `job` (if it still exists) neither references nor is producing this artifact.
    pub fn is_orphan(&self, job: Option<&Job>) -> bool {
        let Some(job) = job else {
            return true;
        };
        let in_flight = job
            .active_attempt()
            .is_some_and(|a| a.stage == self.stage && a.fence == self.fence);
        match self.kind {
            ArtifactKind::Staged => !in_flight,
            ArtifactKind::Published => {
                let referenced = job
                    .output_references()
                    .get(&self.stage)
                    .is_some_and(|o| o.location == self.path);
                !referenced && !in_flight
            }
        }
    }
}

/// Filesystem side of the handoff protocol.
#[derive(Debug, Clone)]
pub struct HandoffArea {
    staging_root: PathBuf,
    output_root: PathBuf,
}

impl HandoffArea {
    pub fn new(staging_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            staging_root: staging_root.into(),
            output_root: output_root.into(),
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn workspace_path(&self, job_id: JobId, stage: Stage, fence: FencingToken) -> PathBuf {
        self.staging_root
            .join(job_id.to_string())
            .join(format!("{stage}.{fence}"))
    }

    pub fn published_path(&self, job_id: JobId, stage: Stage, fence: FencingToken) -> PathBuf {
        self.output_root
            .join(job_id.to_string())
            .join(stage.as_str())
            .join(format!("v{fence}"))
    }

    /// Fresh, empty workspace for one attempt.
    ///
    /// A leftover directory from a crashed run of the same attempt is wiped.
    pub fn prepare(&self, job_id: JobId, stage: Stage, fence: FencingToken) -> Result<PathBuf, HandoffError> {
        let dir = self.workspace_path(job_id, stage, fence);
        remove_dir_if_exists(&dir)?;
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(dir)
    }

    /// Move the workspace to its published location.
    ///
    /// Invisible to downstream stages until the caller commits the returned
    /// reference to the job record.
    pub fn publish(&self, job_id: JobId, stage: Stage, fence: FencingToken) -> Result<OutputReference, HandoffError> {
        let staged = self.workspace_path(job_id, stage, fence);
        if !staged.is_dir() {
            return Err(HandoffError::MissingOutput(staged));
        }

        let target = self.published_path(job_id, stage, fence);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        remove_dir_if_exists(&target)?;
        fs::rename(&staged, &target).map_err(io_err(&target))?;
        debug!(job_id = %job_id, stage = %stage, fence = %fence, path = %target.display(), "output staged for commit");

        Ok(OutputReference {
            stage,
            location: target,
            fence,
            committed_at: Utc::now(),
        })
    }

    /// After a successful commit: drop every other version of this stage's output.
    pub fn retain_only(&self, job_id: JobId, stage: Stage, keep: &Path) -> Result<usize, HandoffError> {
        let dir = self.output_root.join(job_id.to_string()).join(stage.as_str());
        let mut removed = 0;
        for artifact in self.scan_dir(&dir, ArtifactKind::Published, job_id)? {
            if artifact.stage == stage && artifact.path != keep {
                remove_dir_if_exists(&artifact.path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove a directory produced by an attempt whose commit was rejected.
    pub fn discard(&self, path: &Path) -> Result<(), HandoffError> {
        remove_dir_if_exists(path)
    }

    /// Remove every staged and published artifact of `job_id`.
    pub fn purge_job(&self, job_id: JobId) -> Result<(), HandoffError> {
        remove_dir_if_exists(&self.staging_root.join(job_id.to_string()))?;
        remove_dir_if_exists(&self.output_root.join(job_id.to_string()))
    }

    /// Remove a deleted job's intake source so no rescan can register it again.
    ///
    /// Returns `false` if the file was already gone.
    pub fn remove_source(&self, source: &Path) -> Result<bool, HandoffError> {
        match fs::remove_file(source) {
            Ok(()) => {
                debug!(source = %source.display(), "intake source removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HandoffError::Io {
                path: source.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Every attempt directory currently on disk.
    pub fn artifacts(&self) -> Result<Vec<Artifact>, HandoffError> {
        let mut found = Vec::new();
        for (root, kind) in [
            (&self.staging_root, ArtifactKind::Staged),
            (&self.output_root, ArtifactKind::Published),
        ] {
            if !root.is_dir() {
                continue;
            }
            let depth = match kind {
                ArtifactKind::Staged => 2,
                ArtifactKind::Published => 3,
            };
            for entry in WalkDir::new(root).min_depth(depth).max_depth(depth) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(err) => {
                        warn!(error = %err, "unreadable entry in handoff tree");
                        continue;
                    }
                };
                if entry.file_type().is_dir() {
                    if let Some(artifact) = parse_artifact(root, entry.path(), kind) {
                        found.push(artifact);
                    }
                }
            }
        }
        Ok(found)
    }

    fn scan_dir(&self, dir: &Path, kind: ArtifactKind, job_id: JobId) -> Result<Vec<Artifact>, HandoffError> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err(dir))? {
            let entry = entry.map_err(io_err(dir))?;
            let root = match kind {
                ArtifactKind::Staged => &self.staging_root,
                ArtifactKind::Published => &self.output_root,
            };
            if let Some(a) = parse_artifact(root, &entry.path(), kind) {
                if a.job_id == job_id {
                    found.push(a);
                }
            }
        }
        Ok(found)
    }
}

fn parse_artifact(root: &Path, path: &Path, kind: ArtifactKind) -> Option<Artifact> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel.iter().filter_map(|c| c.to_str()).collect();
    let (job_id, stage, fence) = match (kind, parts.as_slice()) {
        (ArtifactKind::Staged, [job, attempt]) => {
            let (stage, fence) = attempt.rsplit_once('.')?;
            (*job, stage, fence)
        }
        (ArtifactKind::Published, [job, stage, version]) => (*job, *stage, version.strip_prefix('v')?),
        _ => return None,
    };
    Some(Artifact {
        job_id: job_id.parse().ok()?,
        stage: Stage::parse(stage)?,
        fence: FencingToken::new(fence.parse().ok()?),
        kind,
        path: path.to_path_buf(),
    })
}

fn remove_dir_if_exists(path: &Path) -> Result<(), HandoffError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(HandoffError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area() -> (tempfile::TempDir, HandoffArea) {
        let dir = tempfile::tempdir().unwrap();
        let area = HandoffArea::new(dir.path().join("staging"), dir.path().join("output"));
        (dir, area)
    }

    #[test]
    fn publish_moves_workspace_atomically() {
        let (_dir, area) = area();
        let job = JobId::new();
        let fence = FencingToken::new(3);

        let ws = area.prepare(job, Stage::Separating, fence).unwrap();
        fs::write(ws.join("vocals.wav"), b"stem").unwrap();

        let out = area.publish(job, Stage::Separating, fence).unwrap();
        assert!(!ws.exists());
        assert!(out.location.join("vocals.wav").is_file());
        assert_eq!(out.fence, fence);
    }

    #[test]
    fn remove_source_tolerates_missing_file() {
        let (dir, area) = area();
        let source = dir.path().join("track.wav");
        fs::write(&source, b"RIFF").unwrap();

        assert!(area.remove_source(&source).unwrap());
        assert!(!source.exists());
        assert!(!area.remove_source(&source).unwrap());
    }

    #[test]
    fn publish_without_workspace_fails() {
        let (_dir, area) = area();
        let err = area
            .publish(JobId::new(), Stage::Staging, FencingToken::new(1))
            .unwrap_err();
        assert!(matches!(err, HandoffError::MissingOutput(_)));
    }

    #[test]
    fn retain_only_keeps_one_version_per_stage() {
        let (_dir, area) = area();
        let job = JobId::new();
        for fence in [1, 2, 3] {
            area.prepare(job, Stage::Staging, FencingToken::new(fence)).unwrap();
            area.publish(job, Stage::Staging, FencingToken::new(fence)).unwrap();
        }
        let keep = area.published_path(job, Stage::Staging, FencingToken::new(3));
        assert_eq!(area.retain_only(job, Stage::Staging, &keep).unwrap(), 2);

        let left: Vec<_> = area
            .artifacts()
            .unwrap()
            .into_iter()
            .filter(|a| a.kind == ArtifactKind::Published)
            .collect();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].path, keep);
    }

    #[test]
    fn artifacts_are_parsed_from_both_trees() {
        let (_dir, area) = area();
        let job = JobId::new();
        area.prepare(job, Stage::Reconstructing, FencingToken::new(9)).unwrap();
        area.prepare(job, Stage::Staging, FencingToken::new(4)).unwrap();
        area.publish(job, Stage::Staging, FencingToken::new(4)).unwrap();

        let mut found = area.artifacts().unwrap();
        found.sort_by_key(|a| a.fence);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].kind, ArtifactKind::Published);
        assert_eq!(found[0].stage, Stage::Staging);
        assert_eq!(found[1].kind, ArtifactKind::Staged);
        assert_eq!(found[1].stage, Stage::Reconstructing);

        assert!(found[0].is_orphan(None));
        area.purge_job(job).unwrap();
        assert!(area.artifacts().unwrap().is_empty());
    }
}
