//! Cross-process leases in Postgres.
//!
//! `job_leases` holds one row per `(job_id, state)`. A grant is an upsert that
//! only overwrites an expired row; tokens come from the `lease_fence_seq`
//! sequence so they increase across every process sharing the database.
//! Expiry is judged by the database clock (`now()`).

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;

use im2_core::{FencingToken, JobId, JobState, WorkerId};

use super::{LeaseGrant, LockError, LockKey, LockManager};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job_leases (
        job_id     UUID NOT NULL,
        state      TEXT NOT NULL,
        holder     TEXT NOT NULL,
        token      BIGINT NOT NULL,
        expires_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (job_id, state)
    )
    "#,
    "CREATE SEQUENCE IF NOT EXISTS lease_fence_seq",
];

#[derive(Debug, Clone)]
pub struct PostgresLockManager {
    pool: PgPool,
    handle: Handle,
}

impl PostgresLockManager {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Create the lease table and token sequence; lift the sequence above `floor`.
    pub async fn ensure_schema(&self, floor: FencingToken) -> Result<(), LockError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| backend("ensure_schema", e))?;
        }
        if floor > FencingToken::ZERO {
            sqlx::query(
                "SELECT setval('lease_fence_seq', GREATEST($1, (SELECT last_value FROM lease_fence_seq)))",
            )
            .bind(floor.value() as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| backend("seed_sequence", e))?;
        }
        Ok(())
    }

    async fn try_acquire_async(
        &self,
        key: LockKey,
        holder: &WorkerId,
        lease: Duration,
    ) -> Result<Option<LeaseGrant>, LockError> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_leases (job_id, state, holder, token, expires_at)
            VALUES ($1, $2, $3, nextval('lease_fence_seq'), now() + make_interval(secs => $4))
            ON CONFLICT (job_id, state) DO UPDATE SET
                holder = EXCLUDED.holder,
                token = EXCLUDED.token,
                expires_at = EXCLUDED.expires_at
            WHERE job_leases.expires_at < now()
            RETURNING token, expires_at
            "#,
        )
        .bind(key.job_id.as_uuid())
        .bind(key.state.as_str())
        .bind(holder.as_str())
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("try_acquire", e))?;

        row.map(|r| grant_from(key, holder.clone(), &r)).transpose()
    }

    async fn renew_async(&self, grant: &LeaseGrant, lease: Duration) -> Result<LeaseGrant, LockError> {
        let row = sqlx::query(
            r#"
            UPDATE job_leases
            SET expires_at = now() + make_interval(secs => $4)
            WHERE job_id = $1 AND state = $2 AND token = $3 AND expires_at >= now()
            RETURNING token, expires_at
            "#,
        )
        .bind(grant.key.job_id.as_uuid())
        .bind(grant.key.state.as_str())
        .bind(grant.token.value() as i64)
        .bind(lease.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("renew", e))?;

        match row {
            Some(r) => grant_from(grant.key, grant.holder.clone(), &r),
            None => Err(LockError::Lost {
                key: grant.key,
                token: grant.token,
            }),
        }
    }

    async fn release_async(&self, grant: &LeaseGrant) -> Result<(), LockError> {
        sqlx::query("DELETE FROM job_leases WHERE job_id = $1 AND state = $2 AND token = $3")
            .bind(grant.key.job_id.as_uuid())
            .bind(grant.key.state.as_str())
            .bind(grant.token.value() as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| backend("release", e))?;
        Ok(())
    }

    async fn holder_async(&self, key: LockKey) -> Result<Option<LeaseGrant>, LockError> {
        let row = sqlx::query(
            r#"
            SELECT holder, token, expires_at
            FROM job_leases
            WHERE job_id = $1 AND state = $2 AND expires_at >= now()
            "#,
        )
        .bind(key.job_id.as_uuid())
        .bind(key.state.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend("holder", e))?;

        row.map(|r| {
            let holder: String = r.try_get("holder").map_err(|e| backend("holder", e))?;
            let holder = WorkerId::parse(holder).map_err(|e| LockError::Backend(e.to_string()))?;
            grant_from(key, holder, &r)
        })
        .transpose()
    }

    async fn reap_async(&self) -> Result<Vec<LeaseGrant>, LockError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM job_leases
            WHERE expires_at < now()
            RETURNING job_id, state, holder, token, expires_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| backend("reap_expired", e))?;

        let mut reaped = Vec::with_capacity(rows.len());
        for r in rows {
            let job_id: uuid::Uuid = r.try_get("job_id").map_err(|e| backend("reap_expired", e))?;
            let state: String = r.try_get("state").map_err(|e| backend("reap_expired", e))?;
            let holder: String = r.try_get("holder").map_err(|e| backend("reap_expired", e))?;
            let state = JobState::parse(&state)
                .ok_or_else(|| LockError::Backend(format!("unknown lease state {state}")))?;
            let holder = WorkerId::parse(holder).map_err(|e| LockError::Backend(e.to_string()))?;
            reaped.push(grant_from(
                LockKey::new(JobId::from_uuid(job_id), state),
                holder,
                &r,
            )?);
        }
        Ok(reaped)
    }
}

impl LockManager for PostgresLockManager {
    fn try_acquire(
        &self,
        key: LockKey,
        holder: &WorkerId,
        lease: Duration,
    ) -> Result<Option<LeaseGrant>, LockError> {
        self.handle.block_on(self.try_acquire_async(key, holder, lease))
    }

    fn renew(&self, grant: &LeaseGrant, lease: Duration) -> Result<LeaseGrant, LockError> {
        self.handle.block_on(self.renew_async(grant, lease))
    }

    fn release(&self, grant: &LeaseGrant) -> Result<(), LockError> {
        self.handle.block_on(self.release_async(grant))
    }

    fn validate(&self, grant: &LeaseGrant) -> Result<(), LockError> {
        match self.handle.block_on(self.holder_async(grant.key))? {
            Some(current) if current.token == grant.token => Ok(()),
            _ => Err(LockError::Lost {
                key: grant.key,
                token: grant.token,
            }),
        }
    }

    fn holder(&self, key: LockKey) -> Result<Option<LeaseGrant>, LockError> {
        self.handle.block_on(self.holder_async(key))
    }

    fn reap_expired(&self) -> Result<Vec<LeaseGrant>, LockError> {
        self.handle.block_on(self.reap_async())
    }
}

fn grant_from(key: LockKey, holder: WorkerId, row: &sqlx::postgres::PgRow) -> Result<LeaseGrant, LockError> {
    let token: i64 = row.try_get("token").map_err(|e| backend("read_grant", e))?;
    let expires_at: DateTime<Utc> = row.try_get("expires_at").map_err(|e| backend("read_grant", e))?;
    Ok(LeaseGrant {
        key,
        holder,
        token: FencingToken::new(token as u64),
        expires_at,
    })
}

fn backend(operation: &str, err: sqlx::Error) -> LockError {
    LockError::Backend(format!("sqlx error in {operation}: {err}"))
}
