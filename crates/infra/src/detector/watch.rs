//! `notify`-backed source of [`FsChange`]s.

use std::path::Path;
use std::sync::mpsc::{Receiver, TryRecvError, channel};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use super::{DetectorError, FsChange};

/// Recursive watch on the intake root.
///
/// Events are buffered in a channel and drained by the detector loop; the
/// watcher itself never blocks.
pub struct IntakeWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<Event>,
}

impl IntakeWatcher {
    pub fn start(root: &Path) -> Result<Self, DetectorError> {
        let (tx, rx) = channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(error = %e, "intake watcher error"),
            },
            NotifyConfig::default(),
        )
        .map_err(|e| DetectorError::Watch(e.to_string()))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| DetectorError::Watch(format!("watch {}: {e}", root.display())))?;

        Ok(Self {
            _watcher: watcher,
            events: rx,
        })
    }

    /// Everything received since the last drain.
    pub fn drain(&self) -> Vec<FsChange> {
        let mut changes = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => changes.extend(convert_event(&event)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        changes
    }
}

fn convert_event(event: &Event) -> Vec<FsChange> {
    let paths = &event.paths;
    match event.kind {
        EventKind::Create(_) => paths.iter().cloned().map(FsChange::Created).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::new();
            if let Some(from) = paths.first() {
                out.push(FsChange::Removed(from.clone()));
            }
            if let Some(to) = paths.get(1) {
                out.push(FsChange::MovedIn(to.clone()));
            }
            out
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.iter().cloned().map(FsChange::MovedIn).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().cloned().map(FsChange::Removed).collect()
        }
        EventKind::Modify(_) => paths.iter().cloned().map(FsChange::Modified).collect(),
        EventKind::Remove(_) => paths.iter().cloned().map(FsChange::Removed).collect(),
        _ => Vec::new(),
    }
}
