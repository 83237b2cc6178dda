//! Process-wide pause flag read by the lock-granting path.

use std::sync::atomic::{AtomicBool, Ordering};

/// Set by `pause`, cleared by `resume`, checked before every new stage grant.
///
/// In-flight work keeps its leases and drains normally.
#[derive(Debug, Default)]
pub struct PauseGate {
    paused: AtomicBool,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call changed the flag.
    pub fn pause(&self) -> bool {
        !self.paused.swap(true, Ordering::SeqCst)
    }

    /// Returns `true` if this call changed the flag.
    pub fn resume(&self) -> bool {
        self.paused.swap(false, Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}
