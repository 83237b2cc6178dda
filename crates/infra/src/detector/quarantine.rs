//! Moving problem files out of the intake tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DetectorError;

/// Sidecar written next to every quarantined file (`<file>.reason.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub reason: String,
    pub attempts: u32,
    pub quarantined_at: DateTime<Utc>,
}

impl QuarantineRecord {
    /// Owner directory of the original path, when the layout had one.
    pub fn owner_hint(&self, intake_root: &Path) -> Option<String> {
        let rel = self.source.strip_prefix(intake_root).ok()?;
        let mut parts = rel.iter();
        let owner = parts.next()?.to_str()?;
        // A bare file directly under the root has no owner directory.
        parts.next()?;
        Some(owner.to_string())
    }
}

/// Mirrors the intake layout under a separate root.
#[derive(Debug, Clone)]
pub struct Quarantine {
    intake_root: PathBuf,
    root: PathBuf,
}

impl Quarantine {
    pub fn new(intake_root: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Self {
        Self {
            intake_root: intake_root.into(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Move `path` into quarantine and write its reason sidecar.
    pub fn isolate(&self, path: &Path, reason: &str, attempts: u32) -> Result<QuarantineRecord, DetectorError> {
        let rel = path
            .strip_prefix(&self.intake_root)
            .ok()
            .map(Path::to_path_buf)
            .or_else(|| path.file_name().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("unnamed"));

        let mut destination = self.root.join(&rel);
        if destination.exists() {
            let stamp = Utc::now().timestamp_millis();
            let name = destination
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unnamed")
                .to_string();
            destination.set_file_name(format!("{name}.{stamp}"));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|source| DetectorError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        move_file(path, &destination).map_err(|source| DetectorError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let record = QuarantineRecord {
            source: path.to_path_buf(),
            destination: destination.clone(),
            reason: reason.to_string(),
            attempts,
            quarantined_at: Utc::now(),
        };
        let sidecar = sidecar_path(&destination);
        let body = serde_json::to_vec_pretty(&record).map_err(|e| DetectorError::Io {
            path: sidecar.clone(),
            source: io::Error::other(e),
        })?;
        fs::write(&sidecar, body).map_err(|source| DetectorError::Io { path: sidecar, source })?;
        Ok(record)
    }
}

fn sidecar_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".reason.json");
    destination.with_file_name(name)
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
