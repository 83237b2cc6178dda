//! Stability detection for the intake tree.
//!
//! The detector is fed raw filesystem changes (from [`IntakeWatcher`] or a
//! rescan) and is polled periodically. A file becomes a candidate arrival
//! once its size, modification time and identity stayed unchanged for the
//! quiescence window and it entered the tree through a rename. Excluded
//! names (hidden, temporary suffixes, zero-byte) are ignored permanently.
//! Unreadable files are retried with backoff and quarantined on exhaustion.
//!
//! Within one batch (`owner/marker`), arrivals are emitted in the order the
//! files were first seen: a stable file waits for earlier, still-settling
//! files of the same batch.

mod quarantine;
mod watch;

pub use quarantine::{Quarantine, QuarantineRecord};
pub use watch::IntakeWatcher;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use im2_core::{OwnerId, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("filesystem watch error: {0}")]
    Watch(String),
}

/// Detector tuning. Every value is independently configurable.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub intake_root: PathBuf,
    pub quarantine_root: PathBuf,
    /// How long size + mtime must stay unchanged.
    pub quiescence: Duration,
    /// Retry schedule (and ceiling) for unreadable files.
    pub retry: RetryPolicy,
    /// Only files that entered the tree through a rename become arrivals.
    pub require_atomic_rename: bool,
    /// Name suffixes of in-progress uploads.
    pub temp_suffixes: Vec<String>,
}

impl DetectorSettings {
    pub fn new(intake_root: impl Into<PathBuf>, quarantine_root: impl Into<PathBuf>) -> Self {
        Self {
            intake_root: intake_root.into(),
            quarantine_root: quarantine_root.into(),
            quiescence: Duration::from_secs(5),
            retry: RetryPolicy::exponential(5, Duration::from_millis(500), Duration::from_secs(30)),
            require_atomic_rename: true,
            temp_suffixes: [".tmp", ".part", ".partial", ".crdownload", ".download", ".swp", "~"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    /// Hidden or temporary-suffix names are never candidates.
    pub fn is_excluded_name(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return true;
        };
        name.starts_with('.') || self.temp_suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }
}

/// A raw change under the intake root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    /// Fresh file created in place (possibly still open).
    Created(PathBuf),
    /// Renamed or moved into the tree.
    MovedIn(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

/// A file the detector believes is a complete, stable unit of new work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateArrival {
    pub owner_id: OwnerId,
    pub batch_marker: String,
    pub source_path: PathBuf,
    pub detected_at: DateTime<Utc>,
    /// Order in which the file was first seen by this detector.
    pub detection_seq: u64,
}

/// Result of one poll.
#[derive(Debug, Default)]
pub struct DetectorOutput {
    pub arrivals: Vec<CandidateArrival>,
    pub quarantined: Vec<QuarantineRecord>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Origin {
    Created,
    Renamed,
    /// Already present when scanned; nothing is writing it as far as we know.
    Scanned,
}

/// What identifies "the same physical file" across polls.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Identity {
    inode: u64,
    size: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug)]
struct Tracked {
    seq: u64,
    origin: Origin,
    last: Option<Identity>,
    stable_since: Instant,
    failures: u32,
    retry_at: Option<Instant>,
}

/// Decides when files under the intake root are genuine arrivals.
#[derive(Debug)]
pub struct StabilityDetector {
    settings: DetectorSettings,
    quarantine: Quarantine,
    tracked: HashMap<PathBuf, Tracked>,
    /// `path → inode` of every arrival emitted in this detector's lifetime.
    emitted: HashMap<PathBuf, u64>,
    ignored: HashSet<PathBuf>,
    next_seq: u64,
}

impl StabilityDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        let quarantine = Quarantine::new(&settings.intake_root, &settings.quarantine_root);
        Self {
            settings,
            quarantine,
            tracked: HashMap::new(),
            emitted: HashMap::new(),
            ignored: HashSet::new(),
            next_seq: 1,
        }
    }

    pub fn settings(&self) -> &DetectorSettings {
        &self.settings
    }

    /// Files currently being watched for stability.
    pub fn pending(&self) -> usize {
        self.tracked.len()
    }

    pub fn observe(&mut self, change: FsChange) {
        self.observe_at(change, Instant::now());
    }

    pub fn observe_at(&mut self, change: FsChange, now: Instant) {
        let (path, origin) = match change {
            FsChange::Removed(path) => {
                self.tracked.remove(&path);
                return;
            }
            FsChange::Created(path) => (path, Origin::Created),
            FsChange::MovedIn(path) => (path, Origin::Renamed),
            FsChange::Modified(path) => (path, Origin::Created),
        };
        self.track(path, origin, now);
    }

    /// Walk the intake tree and track files not seen yet.
    ///
    /// A file already emitted is tracked again only if `has_record` says no
    /// job exists for it. Returns how many files started being tracked.
    pub fn rescan(&mut self, has_record: &dyn Fn(&Path) -> bool) -> usize {
        let now = Instant::now();
        let root = self.settings.intake_root.clone();
        if !root.is_dir() {
            return 0;
        }
        let mut added = 0;
        for entry in WalkDir::new(&root).min_depth(1).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(error = %err, "unreadable entry during intake scan");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if self.tracked.contains_key(&path) || self.ignored.contains(&path) {
                continue;
            }
            if self.emitted.contains_key(&path) {
                if has_record(&path) {
                    continue;
                }
                self.emitted.remove(&path);
            }
            if self.track(path, Origin::Scanned, now) {
                added += 1;
            }
        }
        added
    }

    pub fn poll(&mut self) -> DetectorOutput {
        self.poll_at(Instant::now())
    }

    /// Advance every tracked file; emit what became stable.
    pub fn poll_at(&mut self, now: Instant) -> DetectorOutput {
        let mut output = DetectorOutput::default();
        let mut ready: Vec<(PathBuf, u64, u64)> = Vec::new();
        let mut exhausted: Vec<(PathBuf, String, u32)> = Vec::new();
        let mut gone: Vec<PathBuf> = Vec::new();
        let mut zero_byte: Vec<PathBuf> = Vec::new();

        for (path, t) in self.tracked.iter_mut() {
            if t.retry_at.is_some_and(|at| now < at) {
                continue;
            }
            match probe(path) {
                Ok(None) => gone.push(path.clone()),
                Ok(Some(identity)) => {
                    t.failures = 0;
                    t.retry_at = None;
                    if t.last != Some(identity) {
                        t.last = Some(identity);
                        t.stable_since = now;
                        continue;
                    }
                    if now.duration_since(t.stable_since) < self.settings.quiescence {
                        continue;
                    }
                    if self.settings.require_atomic_rename && t.origin == Origin::Created {
                        continue;
                    }
                    if identity.size == 0 {
                        zero_byte.push(path.clone());
                    } else {
                        ready.push((path.clone(), t.seq, identity.inode));
                    }
                }
                Err(err) => {
                    t.failures += 1;
                    if !self.settings.retry.should_retry(t.failures) {
                        exhausted.push((path.clone(), format!("unreadable: {err}"), t.failures));
                    } else {
                        let delay = self.settings.retry.delay_for_attempt(t.failures);
                        t.retry_at = Some(now + delay);
                        debug!(path = %path.display(), attempt = t.failures, error = %err, "intake file not readable yet");
                    }
                }
            }
        }

        for path in gone {
            self.tracked.remove(&path);
        }
        for path in zero_byte {
            debug!(path = %path.display(), "ignoring zero-byte file");
            self.tracked.remove(&path);
            self.ignored.insert(path);
        }
        for (path, reason, attempts) in exhausted {
            self.tracked.remove(&path);
            self.quarantine_path(&path, &reason, attempts, &mut output);
        }

        // Hold back files that would overtake an earlier file of their batch.
        let ready_paths: HashSet<&PathBuf> = ready.iter().map(|(p, _, _)| p).collect();
        let mut earliest_pending: BTreeMap<(String, String), u64> = BTreeMap::new();
        for (path, t) in &self.tracked {
            let blocks = !ready_paths.contains(path)
                && !(self.settings.require_atomic_rename && t.origin == Origin::Created);
            if blocks {
                if let Ok((owner, marker)) = self.batch_of(path) {
                    let e = earliest_pending.entry((owner, marker)).or_insert(t.seq);
                    *e = (*e).min(t.seq);
                }
            }
        }
        ready.sort_by_key(|(_, seq, _)| *seq);

        let mut emit = Vec::new();
        for (path, seq, inode) in ready {
            match self.batch_of(&path) {
                Ok(batch) => {
                    if earliest_pending.get(&batch).is_some_and(|first| *first < seq) {
                        continue;
                    }
                    emit.push((path, seq, inode));
                }
                Err(()) => {
                    self.tracked.remove(&path);
                    self.quarantine_path(&path, "layout", 0, &mut output);
                }
            }
        }

        for (path, seq, inode) in emit {
            self.tracked.remove(&path);
            if self.emitted.get(&path) == Some(&inode) {
                continue;
            }
            let Ok((owner, marker)) = self.batch_of(&path) else {
                continue;
            };
            let Ok(owner_id) = OwnerId::parse(owner) else {
                continue;
            };
            self.emitted.insert(path.clone(), inode);
            info!(path = %path.display(), owner = %owner_id, batch = %marker, seq, "stable arrival detected");
            output.arrivals.push(CandidateArrival {
                owner_id,
                batch_marker: marker,
                source_path: path,
                detected_at: Utc::now(),
                detection_seq: seq,
            });
        }

        output
    }

    /// Start tracking `path`; returns `false` if it is excluded.
    fn track(&mut self, path: PathBuf, origin: Origin, now: Instant) -> bool {
        if self.ignored.contains(&path) {
            return false;
        }
        if self.settings.is_excluded_name(&path) {
            debug!(path = %path.display(), "ignoring excluded intake file");
            self.ignored.insert(path);
            return false;
        }
        match self.tracked.get_mut(&path) {
            Some(t) => {
                if origin == Origin::Renamed {
                    t.origin = Origin::Renamed;
                }
                t.stable_since = now;
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.tracked.insert(
                    path,
                    Tracked {
                        seq,
                        origin,
                        last: None,
                        stable_since: now,
                        failures: 0,
                        retry_at: None,
                    },
                );
            }
        }
        true
    }

    /// `(owner, marker)` for `<intake>/<owner>/<marker>/<file>`.
    fn batch_of(&self, path: &Path) -> Result<(String, String), ()> {
        let rel = path.strip_prefix(&self.settings.intake_root).map_err(|_| ())?;
        let parts: Vec<&str> = rel.iter().map(|c| c.to_str().ok_or(())).collect::<Result<_, _>>()?;
        match parts.as_slice() {
            [owner, marker, _file] if !owner.trim().is_empty() && !marker.trim().is_empty() => {
                Ok((owner.to_string(), marker.to_string()))
            }
            _ => Err(()),
        }
    }

    fn quarantine_path(&mut self, path: &Path, reason: &str, attempts: u32, output: &mut DetectorOutput) {
        match self.quarantine.isolate(path, reason, attempts) {
            Ok(record) => {
                warn!(path = %path.display(), destination = %record.destination.display(), reason, "file quarantined");
                output.quarantined.push(record);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, reason, "quarantine failed; ignoring file");
                self.ignored.insert(path.to_path_buf());
            }
        }
    }
}

/// `Ok(None)` if the file is gone; `Err` if it exists but cannot be read.
fn probe(path: &Path) -> io::Result<Option<Identity>> {
    let meta = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if !meta.is_file() {
        return Ok(None);
    }
    // Lock-contended or permission-denied files surface here.
    fs::File::open(path)?;
    Ok(Some(Identity {
        inode: inode_of(&meta),
        size: meta.len(),
        modified: meta.modified().ok(),
    }))
}

#[cfg(unix)]
fn inode_of(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &fs::Metadata) -> u64 {
    0
}
