//! Postgres-backed job store.
//!
//! ## Schema
//!
//! - `jobs`: one row per job; the full record lives in `document` (JSONB), the
//!   columns the store filters on are denormalised next to it. `source_reference`
//!   is `UNIQUE`, which is what makes registration at-most-once across processes.
//! - `job_history`: append-only mirror of `stage_history`, one row per entry.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! ## Sync facade
//!
//! `JobStore` is synchronous (router, sweeper and stage executors run on std
//! threads). Each call is driven to completion with `Handle::block_on` on the
//! runtime captured at construction; it must not be called from inside an
//! async task of that runtime.

use std::path::Path;

use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use im2_core::{ExpectedRevision, FencingToken, HistoryEntry, Job, JobId};

use super::{InsertOutcome, JobFilter, JobStore, StoreError, ensure_supported};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        job_id           UUID PRIMARY KEY,
        owner_id         TEXT NOT NULL,
        state            TEXT NOT NULL,
        source_reference TEXT NOT NULL UNIQUE,
        revision         BIGINT NOT NULL,
        fence            BIGINT NOT NULL DEFAULT 0,
        schema_version   INTEGER NOT NULL,
        detection_seq    BIGINT NOT NULL,
        created_at       TIMESTAMPTZ NOT NULL,
        updated_at       TIMESTAMPTZ NOT NULL,
        document         JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_state_created_idx ON jobs (state, created_at, detection_seq)",
    "CREATE INDEX IF NOT EXISTS jobs_owner_idx ON jobs (owner_id)",
    r#"
    CREATE TABLE IF NOT EXISTS job_history (
        job_id  UUID NOT NULL,
        seq     BIGINT NOT NULL,
        at      TIMESTAMPTZ NOT NULL,
        actor   TEXT NOT NULL,
        entry   JSONB NOT NULL,
        PRIMARY KEY (job_id, seq)
    )
    "#,
];

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresJobStore {
    /// Wrap an existing pool; `handle` drives the sync facade.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id()), err)]
    async fn insert_async(&self, mut job: Job) -> Result<InsertOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        job.set_revision(1);
        let document = to_document(&job)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, owner_id, state, source_reference, revision, fence,
                schema_version, detection_seq, created_at, updated_at, document
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (source_reference) DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(job.job_id().as_uuid())
        .bind(job.owner_id().as_str())
        .bind(job.state().as_str())
        .bind(source_key(job.source_reference()))
        .bind(job.revision() as i64)
        .bind(job.fence().value() as i64)
        .bind(job.schema_version() as i32)
        .bind(job.detection_seq() as i64)
        .bind(job.created_at())
        .bind(job.updated_at())
        .bind(document)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        if inserted.is_none() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            let existing = self
                .find_by_source_async(job.source_reference())
                .await?
                .ok_or_else(|| {
                    StoreError::Storage("source conflict but no existing job found".into())
                })?;
            debug!(existing = %existing.job_id(), "source already registered");
            return Ok(InsertOutcome::Existing(existing));
        }

        append_history(&mut tx, job.job_id(), job.history(), 0).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(InsertOutcome::Inserted(job))
    }

    async fn get_async(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT document FROM jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.map(|r| from_row(&r)).transpose()
    }

    async fn find_by_source_async(&self, source: &Path) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT document FROM jobs WHERE source_reference = $1")
            .bind(source_key(source))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_source", e))?;
        row.map(|r| from_row(&r)).transpose()
    }

    async fn list_async(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let states: Vec<String> = filter.states.iter().map(|s| s.as_str().to_string()).collect();
        let states_param: Option<Vec<String>> = (!states.is_empty()).then_some(states);
        let owner_param: Option<&str> = filter.owner.as_ref().map(|o| o.as_str());
        let limit: i64 = filter.limit.map(|l| l as i64).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            SELECT document
            FROM jobs
            WHERE ($1::text IS NULL OR owner_id = $1)
              AND ($2::text[] IS NULL OR state = ANY($2))
            ORDER BY created_at ASC, detection_seq ASC, job_id ASC
            OFFSET $3
            LIMIT $4
            "#,
        )
        .bind(owner_param)
        .bind(states_param)
        .bind(filter.offset as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.iter().map(from_row).collect()
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id(), expected = ?expected), err)]
    async fn save_async(&self, job: &Job, expected: ExpectedRevision) -> Result<u64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current: Option<i64> = sqlx::query("SELECT revision FROM jobs WHERE job_id = $1 FOR UPDATE")
            .bind(job.job_id().as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_job_row", e))?
            .map(|r| r.try_get::<i64, _>("revision"))
            .transpose()
            .map_err(|e| map_sqlx_error("read_revision", e))?;

        let current = current.map(|r| r as u64);
        if !expected.matches(current) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::Conflict(format!(
                "job {}: expected {expected:?}, found {current:?}",
                job.job_id()
            )));
        }

        let next = current.unwrap_or(0) + 1;
        let mut saved = job.clone();
        saved.set_revision(next);
        let document = to_document(&saved)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, owner_id, state, source_reference, revision, fence,
                schema_version, detection_seq, created_at, updated_at, document
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (job_id) DO UPDATE SET
                state = EXCLUDED.state,
                revision = EXCLUDED.revision,
                fence = EXCLUDED.fence,
                updated_at = EXCLUDED.updated_at,
                document = EXCLUDED.document
            "#,
        )
        .bind(saved.job_id().as_uuid())
        .bind(saved.owner_id().as_str())
        .bind(saved.state().as_str())
        .bind(source_key(saved.source_reference()))
        .bind(next as i64)
        .bind(saved.fence().value() as i64)
        .bind(saved.schema_version() as i32)
        .bind(saved.detection_seq() as i64)
        .bind(saved.created_at())
        .bind(saved.updated_at())
        .bind(document)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("save_job", e))?;

        let persisted: i64 = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM job_history WHERE job_id = $1")
            .bind(saved.job_id().as_uuid())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("history_tail", e))?
            .try_get("seq")
            .map_err(|e| map_sqlx_error("history_tail", e))?;

        append_history(&mut tx, saved.job_id(), saved.history(), persisted as u64).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(next)
    }

    async fn purge_async(&self, job_id: JobId) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let deleted = sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("purge_job", e))?
            .rows_affected();
        if deleted == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::NotFound(job_id));
        }

        sqlx::query("DELETE FROM job_history WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("purge_history", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn max_fence_async(&self) -> Result<FencingToken, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(fence), 0) AS fence FROM jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("max_fence", e))?;
        let fence: i64 = row
            .try_get("fence")
            .map_err(|e| map_sqlx_error("max_fence", e))?;
        Ok(FencingToken::new(fence as u64))
    }
}

impl JobStore for PostgresJobStore {
    fn insert_if_absent(&self, job: Job) -> Result<InsertOutcome, StoreError> {
        self.handle.block_on(self.insert_async(job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.handle.block_on(self.get_async(job_id))
    }

    fn find_by_source(&self, source: &Path) -> Result<Option<Job>, StoreError> {
        self.handle.block_on(self.find_by_source_async(source))
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        self.handle.block_on(self.list_async(filter))
    }

    fn save(&self, job: &mut Job, expected: ExpectedRevision) -> Result<(), StoreError> {
        let revision = self.handle.block_on(self.save_async(job, expected))?;
        job.set_revision(revision);
        Ok(())
    }

    fn purge(&self, job_id: JobId) -> Result<(), StoreError> {
        self.handle.block_on(self.purge_async(job_id))
    }

    fn max_fence(&self) -> Result<FencingToken, StoreError> {
        self.handle.block_on(self.max_fence_async())
    }
}

async fn append_history(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
    history: &[HistoryEntry],
    already_persisted: u64,
) -> Result<(), StoreError> {
    for entry in history.iter().filter(|h| h.seq > already_persisted) {
        let payload = serde_json::to_value(entry)
            .map_err(|e| StoreError::Storage(format!("failed to serialize history entry: {e}")))?;
        sqlx::query(
            "INSERT INTO job_history (job_id, seq, at, actor, entry) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(job_id.as_uuid())
        .bind(entry.seq as i64)
        .bind(entry.at)
        .bind(entry.actor.to_string())
        .bind(payload)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("append_history", e))?;
    }
    Ok(())
}

fn source_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn to_document(job: &Job) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(job).map_err(|e| StoreError::Storage(format!("failed to serialize job: {e}")))
}

fn from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    let document: serde_json::Value = row
        .try_get("document")
        .map_err(|e| map_sqlx_error("read_document", e))?;
    let job: Job = serde_json::from_value(document)
        .map_err(|e| StoreError::Storage(format!("failed to deserialize job row: {e}")))?;
    ensure_supported(job)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
