//! In-process lock table.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use im2_core::{FencingToken, WorkerId};

use super::{LeaseGrant, LockError, LockKey, LockManager, lease_end};

#[derive(Debug)]
struct Table {
    leases: HashMap<LockKey, LeaseGrant>,
    last_token: FencingToken,
}

/// Lock manager for a single process.
///
/// Seed it with the store's highest fence on startup so tokens keep
/// increasing across restarts.
#[derive(Debug)]
pub struct InMemoryLockManager {
    table: Mutex<Table>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::starting_after(FencingToken::ZERO)
    }

    /// Every token issued will be strictly greater than `floor`.
    pub fn starting_after(floor: FencingToken) -> Self {
        Self {
            table: Mutex::new(Table {
                leases: HashMap::new(),
                last_token: floor,
            }),
        }
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, Table>, LockError> {
        self.table
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".into()))
    }
}

impl Default for InMemoryLockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager for InMemoryLockManager {
    fn try_acquire(
        &self,
        key: LockKey,
        holder: &WorkerId,
        lease: Duration,
    ) -> Result<Option<LeaseGrant>, LockError> {
        let now = Utc::now();
        let mut table = self.table()?;

        if let Some(current) = table.leases.get(&key) {
            if !current.is_expired_at(now) {
                return Ok(None);
            }
        }

        table.last_token = table.last_token.next();
        let grant = LeaseGrant {
            key,
            holder: holder.clone(),
            token: table.last_token,
            expires_at: lease_end(now, lease),
        };
        table.leases.insert(key, grant.clone());
        Ok(Some(grant))
    }

    fn renew(&self, grant: &LeaseGrant, lease: Duration) -> Result<LeaseGrant, LockError> {
        let now = Utc::now();
        let mut table = self.table()?;

        match table.leases.get_mut(&grant.key) {
            Some(current) if current.token == grant.token && !current.is_expired_at(now) => {
                current.expires_at = lease_end(now, lease);
                Ok(current.clone())
            }
            _ => Err(LockError::Lost {
                key: grant.key,
                token: grant.token,
            }),
        }
    }

    fn release(&self, grant: &LeaseGrant) -> Result<(), LockError> {
        let mut table = self.table()?;
        if table
            .leases
            .get(&grant.key)
            .is_some_and(|current| current.token == grant.token)
        {
            table.leases.remove(&grant.key);
        }
        Ok(())
    }

    fn validate(&self, grant: &LeaseGrant) -> Result<(), LockError> {
        let now = Utc::now();
        let table = self.table()?;
        match table.leases.get(&grant.key) {
            Some(current) if current.token == grant.token && !current.is_expired_at(now) => Ok(()),
            _ => Err(LockError::Lost {
                key: grant.key,
                token: grant.token,
            }),
        }
    }

    fn holder(&self, key: LockKey) -> Result<Option<LeaseGrant>, LockError> {
        let now = Utc::now();
        Ok(self
            .table()?
            .leases
            .get(&key)
            .filter(|g| !g.is_expired_at(now))
            .cloned())
    }

    fn reap_expired(&self) -> Result<Vec<LeaseGrant>, LockError> {
        let now = Utc::now();
        let mut table = self.table()?;
        let expired: Vec<LockKey> = table
            .leases
            .iter()
            .filter(|(_, g)| g.is_expired_at(now))
            .map(|(k, _)| *k)
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|k| table.leases.remove(&k))
            .collect())
    }
}
