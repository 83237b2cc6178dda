//! Advisory locks with leases and fencing tokens.
//!
//! A lock is keyed by `(job_id, state)`. Every grant carries a lease (expiry)
//! and a fencing token strictly greater than every token issued before it.
//! Expiry without renewal makes the lock acquirable again; that is the only
//! crash-recovery primitive for in-flight work. A worker that outlives its
//! lease still holds a lower token, and the job record rejects its commit.

mod in_memory;
mod postgres;

pub use in_memory::InMemoryLockManager;
pub use postgres::PostgresLockManager;

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use im2_core::{FencingToken, Job, JobId, JobState, WorkerId};

/// What a lock protects: one job in one state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockKey {
    pub job_id: JobId,
    pub state: JobState,
}

impl LockKey {
    pub fn new(job_id: JobId, state: JobState) -> Self {
        Self { job_id, state }
    }
}

impl core::fmt::Display for LockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.job_id, self.state)
    }
}

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub key: LockKey,
    pub holder: WorkerId,
    pub token: FencingToken,
    pub expires_at: DateTime<Utc>,
}

impl LeaseGrant {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Time left on the lease (zero once expired).
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LockError {
    #[error("timed out waiting for lock {0}")]
    Timeout(LockKey),
    /// The lease expired or was taken over; the holder must stop.
    #[error("lease on {key} with token {token} is no longer held")]
    Lost { key: LockKey, token: FencingToken },
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Poll interval of [`LockManager::acquire`].
pub const ACQUIRE_POLL: Duration = Duration::from_millis(25);

/// Advisory lock manager abstraction.
pub trait LockManager: Send + Sync {
    /// Non-blocking attempt; `None` if a live lease is held by anyone.
    fn try_acquire(
        &self,
        key: LockKey,
        holder: &WorkerId,
        lease: Duration,
    ) -> Result<Option<LeaseGrant>, LockError>;

    /// Blocking attempt, bounded by `timeout`.
    fn acquire(
        &self,
        key: LockKey,
        holder: &WorkerId,
        lease: Duration,
        timeout: Duration,
    ) -> Result<LeaseGrant, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(grant) = self.try_acquire(key, holder, lease)? {
                return Ok(grant);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout(key));
            }
            std::thread::sleep(ACQUIRE_POLL.min(deadline - now));
        }
    }

    /// Extend a live lease (heartbeat). Fails with `Lost` once expired or replaced.
    fn renew(&self, grant: &LeaseGrant, lease: Duration) -> Result<LeaseGrant, LockError>;

    /// Release the lease; a no-op if it is no longer held under this token.
    fn release(&self, grant: &LeaseGrant) -> Result<(), LockError>;

    /// `Ok` only while `grant` is the live lease for its key.
    fn validate(&self, grant: &LeaseGrant) -> Result<(), LockError>;

    /// Current live lease on `key`, if any.
    fn holder(&self, key: LockKey) -> Result<Option<LeaseGrant>, LockError>;

    /// Drop every expired lease, returning what was reclaimed.
    fn reap_expired(&self) -> Result<Vec<LeaseGrant>, LockError>;
}

impl<L> LockManager for std::sync::Arc<L>
where
    L: LockManager + ?Sized,
{
    fn try_acquire(
        &self,
        key: LockKey,
        holder: &WorkerId,
        lease: Duration,
    ) -> Result<Option<LeaseGrant>, LockError> {
        (**self).try_acquire(key, holder, lease)
    }

    fn acquire(
        &self,
        key: LockKey,
        holder: &WorkerId,
        lease: Duration,
        timeout: Duration,
    ) -> Result<LeaseGrant, LockError> {
        (**self).acquire(key, holder, lease, timeout)
    }

    fn renew(&self, grant: &LeaseGrant, lease: Duration) -> Result<LeaseGrant, LockError> {
        (**self).renew(grant, lease)
    }

    fn release(&self, grant: &LeaseGrant) -> Result<(), LockError> {
        (**self).release(grant)
    }

    fn validate(&self, grant: &LeaseGrant) -> Result<(), LockError> {
        (**self).validate(grant)
    }

    fn holder(&self, key: LockKey) -> Result<Option<LeaseGrant>, LockError> {
        (**self).holder(key)
    }

    fn reap_expired(&self) -> Result<Vec<LeaseGrant>, LockError> {
        (**self).reap_expired()
    }
}

/// Whether `job` has an attempt in flight whose lease is still held under
/// the attempt's own fencing token.
pub fn attempt_is_live(locks: &dyn LockManager, job: &Job) -> Result<bool, LockError> {
    let Some(active) = job.active_attempt() else {
        return Ok(false);
    };
    let key = LockKey::new(job.job_id(), active.stage.state());
    Ok(locks.holder(key)?.is_some_and(|grant| grant.token == active.fence))
}

pub(crate) fn lease_end(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
