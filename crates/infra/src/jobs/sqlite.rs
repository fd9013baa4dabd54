//! SQLite-backed job store.
//!
//! One database file holds the `jobs` and `config` tables. Several processes may
//! open the same file; exclusivity of claims comes from a compare-and-set
//! `UPDATE ... WHERE state = 'pending'`, which SQLite serializes.
//!
//! Timestamps are stored as fixed-width RFC 3339 text (UTC, microseconds) so that
//! string comparison in SQL agrees with chronological order.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use queuectl_core::{Decision, DomainError, Job, JobId, JobState, WorkerId};

use super::store::{JobStore, JobStoreError, JobSummary};

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, \
                           scheduled_at, last_error, locked_by, locked_at";

/// SQLite job store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if needed) the database file at `path`.
    ///
    /// The parent directory is created when missing. The schema is created by
    /// [`JobStore::init`].
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                JobStoreError::Unavailable(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new().filename(path);
        Self::connect_with(options).await
    }

    /// Connect using a `sqlite:` URL.
    pub async fn connect(url: &str) -> Result<Self, JobStoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("parse database url", e))?;
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, JobStoreError> {
        let options = options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Reserve `id` for `worker` if the row is still `pending` and unchanged since
    /// it was read (`updated_at` equals `seen_updated_at`).
    async fn try_claim(
        &self,
        id: JobId,
        seen_updated_at: &str,
        worker: &WorkerId,
        now_text: &str,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET state = 'processing', locked_by = ?2, locked_at = ?3, updated_at = ?3
             WHERE id = ?1 AND state = 'pending' AND updated_at = ?4
            "#,
        )
        .bind(id.to_string())
        .bind(worker.as_str())
        .bind(now_text)
        .bind(seen_updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim job", e))?;

        Ok(result.rows_affected() == 1)
    }

    /// Write `job`'s mutable columns if the row is still in `expected` state and,
    /// when given, still held by `holder`. Returns whether the row was written.
    async fn compare_and_write(
        &self,
        job: &Job,
        expected: JobState,
        holder: Option<&WorkerId>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET state = ?1,
                   attempts = ?2,
                   updated_at = ?3,
                   scheduled_at = ?4,
                   last_error = ?5,
                   locked_by = ?6,
                   locked_at = ?7
             WHERE id = ?8
               AND state = ?9
               AND (?10 IS NULL OR locked_by = ?10)
            "#,
        )
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(format_ts(job.updated_at))
        .bind(job.scheduled_at.map(format_ts))
        .bind(job.last_error.as_deref())
        .bind(job.locked_by.as_ref().map(WorkerId::as_str))
        .bind(job.locked_at.map(format_ts))
        .bind(job.id.to_string())
        .bind(expected.as_str())
        .bind(holder.map(WorkerId::as_str))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update job", e))?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, defaults), err)]
    async fn init(&self, defaults: &[(&str, String)]) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id            TEXT PRIMARY KEY,
                command       TEXT NOT NULL,
                state         TEXT NOT NULL,
                attempts      INTEGER NOT NULL DEFAULT 0,
                max_retries   INTEGER NOT NULL,
                created_at    TEXT NOT NULL,
                updated_at    TEXT NOT NULL,
                scheduled_at  TEXT NULL,
                last_error    TEXT NULL,
                locked_by     TEXT NULL,
                locked_at     TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create jobs table", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_state_created ON jobs (state, created_at, id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create jobs index", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key    TEXT PRIMARY KEY,
                value  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create config table", e))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin seed", e))?;
        for (key, value) in defaults {
            sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
                .bind(*key)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("seed config", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit seed", e))?;

        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries, created_at, updated_at,
                scheduled_at, last_error, locked_by, locked_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(format_ts(job.created_at))
        .bind(format_ts(job.updated_at))
        .bind(job.scheduled_at.map(format_ts))
        .bind(job.last_error.as_deref())
        .bind(job.locked_by.as_ref().map(WorkerId::as_str))
        .bind(job.locked_at.map(format_ts))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                JobStoreError::AlreadyExists(job.id)
            }
            other => map_sqlx_error("insert job", other),
        })?;

        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get job", e))?;

        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(level = "debug", skip(self, worker), fields(worker = %worker), err)]
    async fn claim_next(
        &self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let now_text = format_ts(now);

        let promoted = sqlx::query(
            r#"
            UPDATE jobs
               SET state = 'pending', updated_at = ?1
             WHERE state = 'failed'
               AND (scheduled_at IS NULL OR scheduled_at <= ?1)
            "#,
        )
        .bind(&now_text)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("promote due jobs", e))?;
        if promoted.rows_affected() > 0 {
            debug!(count = promoted.rows_affected(), "promoted due failed jobs");
        }

        let select = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state = 'pending' AND (scheduled_at IS NULL OR scheduled_at <= ?1) \
             ORDER BY created_at ASC, id ASC LIMIT 1"
        );

        loop {
            let row = sqlx::query(&select)
                .bind(&now_text)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("select claim candidate", e))?;

            let Some(row) = row else {
                return Ok(None);
            };
            let candidate = row_to_job(&row)?;
            let seen: String = row.try_get("updated_at").map_err(corrupt)?;

            if self.try_claim(candidate.id, &seen, worker, &now_text).await? {
                return Ok(Some(candidate));
            }
            // Another worker won this row; look again.
            debug!(job_id = %candidate.id, "lost claim race");
        }
    }

    #[instrument(skip(self, worker, decision), fields(worker = %worker), err)]
    async fn update_if_claimed(
        &self,
        id: JobId,
        worker: &WorkerId,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut job = self.get(id).await?.ok_or(JobStoreError::NotFound(id))?;
        job.apply(worker, decision, now)?;

        if !self
            .compare_and_write(&job, JobState::Processing, Some(worker))
            .await?
        {
            return Err(JobStoreError::Rejected(DomainError::NotClaimed {
                job_id: id,
                worker: worker.to_string(),
            }));
        }
        Ok(job)
    }

    async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, JobStoreError> {
        let rows = match state {
            Some(state) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 \
                     ORDER BY created_at DESC, id DESC"
                ))
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, id DESC"
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("list jobs", e))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn summary(&self) -> Result<JobSummary, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("summarize jobs", e))?;

        let mut summary = JobSummary::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(corrupt)?;
            let n: i64 = row.try_get("n").map_err(corrupt)?;
            let state = JobState::from_str(&state)
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            summary.add(state, u64::try_from(n).unwrap_or_default());
        }
        Ok(summary)
    }

    #[instrument(skip(self), err)]
    async fn requeue_dead(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut job = self.get(id).await?.ok_or(JobStoreError::NotFound(id))?;
        job.retry_from_dlq(now)?;

        if !self.compare_and_write(&job, JobState::Dead, None).await? {
            // Someone moved it first; report against its current state.
            let current = self.get(id).await?.ok_or(JobStoreError::NotFound(id))?;
            return Err(JobStoreError::Rejected(DomainError::InvalidTransition {
                job_id: id,
                from: current.state,
                to: JobState::Pending,
            }));
        }
        Ok(job)
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn reclaim_expired(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state = 'processing' AND locked_at IS NOT NULL AND locked_at < ?1"
        ))
        .bind(format_ts(locked_before))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select expired claims", e))?;

        let mut reclaimed = Vec::new();
        for row in &rows {
            let mut job = row_to_job(row)?;
            let holder = job.locked_by.clone();
            job.reclaim_expired(now)?;
            if self
                .compare_and_write(&job, JobState::Processing, holder.as_ref())
                .await?
            {
                reclaimed.push(job);
            }
        }
        Ok(reclaimed)
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, JobStoreError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get config", e))?;

        row.map(|r| r.try_get::<String, _>("value").map_err(corrupt))
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn set_config(&self, key: &str, value: &str) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set config", e))?;

        Ok(())
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(column: &str, raw: &str) -> Result<DateTime<Utc>, JobStoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| JobStoreError::Corrupt(format!("{column} '{raw}': {e}")))
}

fn parse_opt_ts(column: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, JobStoreError> {
    raw.map(|s| parse_ts(column, &s)).transpose()
}

fn corrupt(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Corrupt(err.to_string())
}

fn row_to_job(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let id: String = row.try_get("id").map_err(corrupt)?;
    let state: String = row.try_get("state").map_err(corrupt)?;
    let attempts: i64 = row.try_get("attempts").map_err(corrupt)?;
    let max_retries: i64 = row.try_get("max_retries").map_err(corrupt)?;
    let created_at: String = row.try_get("created_at").map_err(corrupt)?;
    let updated_at: String = row.try_get("updated_at").map_err(corrupt)?;

    let to_u32 = |column: &str, v: i64| {
        u32::try_from(v).map_err(|_| JobStoreError::Corrupt(format!("{column} out of range: {v}")))
    };

    Ok(Job {
        id: JobId::from_str(&id).map_err(|e| JobStoreError::Corrupt(e.to_string()))?,
        command: row.try_get("command").map_err(corrupt)?,
        state: JobState::from_str(&state).map_err(|e| JobStoreError::Corrupt(e.to_string()))?,
        attempts: to_u32("attempts", attempts)?,
        max_retries: to_u32("max_retries", max_retries)?,
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
        scheduled_at: parse_opt_ts("scheduled_at", row.try_get("scheduled_at").map_err(corrupt)?)?,
        last_error: row.try_get("last_error").map_err(corrupt)?,
        locked_by: row
            .try_get::<Option<String>, _>("locked_by")
            .map_err(corrupt)?
            .map(WorkerId::new),
        locked_at: parse_opt_ts("locked_at", row.try_get("locked_at").map_err(corrupt)?)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Corrupt(format!("{operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => {
            JobStoreError::Unavailable(format!("database error in {operation}: {}", db_err.message()))
        }
        other => JobStoreError::Unavailable(format!("{operation}: {other}")),
    }
}

/// Database file in the temp dir, removed (with its WAL files) on drop.
#[cfg(test)]
pub(crate) struct TempDb(pub(crate) std::path::PathBuf);

#[cfg(test)]
impl TempDb {
    pub(crate) fn new() -> Self {
        Self(std::env::temp_dir().join(format!("queuectl-test-{}.db", uuid::Uuid::now_v7())))
    }
}

#[cfg(test)]
impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.0.display()));
        }
    }
}
