//! The persistent job store.
//!
//! This module contains the core `JobStore` type and its implementation,
//! split across submodules:
//!
//! - `enqueue`: insert and singleton coalescing
//! - `lock`: lock acquisition, transfer, release, and batch fetch
//! - `admin`: listing, counting, and bulk operations
//!
//! Strand maintenance lives in the database itself (triggers plus per-strand
//! advisory locks, see `migrations/`) so every writer observes the same
//! ordering invariants, whether or not it goes through this type.

mod admin;
mod enqueue;
mod lock;

pub use admin::{BulkAction, Selector, TagCount, TagFlavor};
pub use lock::LockedJobs;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tracing::debug;

use crate::job::{backoff_run_at, FailedJob, Job, ON_HOLD_LOCKER, PREFETCH_PREFIX};
use crate::settings::Settings;

/// Column list shared by every `SELECT`/`RETURNING` that produces a `Job`.
pub(crate) const JOB_COLUMNS: &str = "id, priority, attempts, max_attempts, queue, strand, \
     max_concurrent, next_in_strand, run_at, locked_at, locked_by, failed_at, last_error, \
     tag, source, payload, created_at, updated_at";

pub(crate) const FAILED_JOB_COLUMNS: &str = "id, priority, attempts, max_attempts, queue, \
     strand, run_at, locked_at, locked_by, failed_at, last_error, tag, source, payload, \
     original_job_id, created_at";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient database failure; callers decide whether to retry.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("job not found with id {0}")]
    JobNotFound(i64),
    #[error("singleton enqueue requires a strand")]
    SingletonWithoutStrand,
    #[error("queue name must not be empty")]
    EmptyQueue,
    #[error("this listing flavor requires a query string")]
    MissingFlavorQuery,
}

/// Outcome of a reschedule: either the job went back to the ready set with a
/// new `run_at`, or its attempt cap was reached and it moved to the failed
/// set.
#[derive(Debug)]
pub enum RescheduleOutcome {
    Rescheduled { run_at: DateTime<Utc> },
    Failed(FailedJob),
}

/// Handle to the shared job tables. Cheap to clone; all operations go
/// through the connection pool unless a caller-supplied connection binds
/// them to an enclosing transaction.
#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
    settings: Arc<Settings>,
}

impl JobStore {
    pub fn new(pool: PgPool, settings: Arc<Settings>) -> Self {
        Self { pool, settings }
    }

    /// Connect a pool per the configured database settings.
    pub async fn connect(settings: Arc<Settings>) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.database.max_connections)
            .connect(&settings.database.url)
            .await?;
        Ok(Self::new(pool, settings))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_arc(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM delayed_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    pub async fn find_failed(&self, original_job_id: i64) -> Result<Option<FailedJob>, StoreError> {
        let job = sqlx::query_as::<_, FailedJob>(&format!(
            "SELECT {FAILED_JOB_COLUMNS} FROM failed_jobs WHERE original_job_id = $1"
        ))
        .bind(original_job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Read the ready set for a queue and priority band, ordered by
    /// `(priority, run_at, id)`. This is the hot polling path; per-poll
    /// logging is suppressed unless configured otherwise.
    pub async fn find_available(
        &self,
        queue: &str,
        min_priority: Option<i32>,
        max_priority: Option<i32>,
        limit: i64,
    ) -> Result<Vec<Job>, StoreError> {
        if !self.settings.silence_polling {
            debug!(queue, min_priority, max_priority, limit, "polling for available jobs");
        }
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM delayed_jobs \
             WHERE queue = $1 AND priority >= $2 AND priority <= $3 \
               AND run_at <= now() AND locked_at IS NULL AND next_in_strand \
             ORDER BY priority ASC, run_at ASC, id ASC \
             LIMIT $4"
        ))
        .bind(queue)
        .bind(min_priority.unwrap_or(i32::MIN))
        .bind(max_priority.unwrap_or(i32::MAX))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// All currently locked jobs, excluding administrative holds.
    pub async fn running_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM delayed_jobs \
             WHERE locked_at IS NOT NULL AND locked_by <> $1 \
             ORDER BY locked_at ASC"
        ))
        .bind(ON_HOLD_LOCKER)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Delete a job, firing the strand promotion trigger. Returns whether a
    /// row was deleted.
    pub async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM delayed_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Unlock every job still attributed to a worker. Defensive shutdown
    /// path; the normal completion paths already unlocked.
    pub async fn clear_locks(&self, worker_name: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE delayed_jobs \
             SET locked_at = NULL, locked_by = NULL, updated_at = now() \
             WHERE locked_by = $1",
        )
        .bind(worker_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Move a job to the failed set, preserving its attributes and final
    /// lock columns, in a single atomic statement. The delete fires the
    /// strand promotion trigger.
    pub async fn fail_job(&self, id: i64, error: Option<&str>) -> Result<FailedJob, StoreError> {
        let mut conn = self.pool.acquire().await?;
        self.fail_job_on(&mut conn, id, error).await
    }

    pub async fn fail_job_on(
        &self,
        conn: &mut PgConnection,
        id: i64,
        error: Option<&str>,
    ) -> Result<FailedJob, StoreError> {
        let failed = sqlx::query_as::<_, FailedJob>(&format!(
            "WITH failed AS ( \
                 DELETE FROM delayed_jobs WHERE id = $1 RETURNING * \
             ) \
             INSERT INTO failed_jobs \
                 (priority, attempts, max_attempts, queue, strand, run_at, locked_at, \
                  locked_by, failed_at, last_error, tag, source, payload, original_job_id, \
                  created_at) \
             SELECT priority, attempts, max_attempts, queue, strand, run_at, locked_at, \
                    locked_by, now(), COALESCE($2, last_error), tag, source, payload, id, \
                    created_at \
             FROM failed \
             RETURNING {FAILED_JOB_COLUMNS}"
        ))
        .bind(id)
        .bind(error)
        .fetch_optional(&mut *conn)
        .await?;
        failed.ok_or(StoreError::JobNotFound(id))
    }

    /// Reschedule after a failed attempt: bump `attempts`, back off
    /// `run_at`, and unlock; or move to the failed set once the cap is
    /// reached.
    pub async fn reschedule(
        &self,
        job: &Job,
        error: Option<&str>,
    ) -> Result<RescheduleOutcome, StoreError> {
        let mut conn = self.pool.acquire().await?;
        self.reschedule_on(&mut conn, job, error, true).await
    }

    /// Reschedule a job reclaimed from a dead worker. The interrupted
    /// attempt never reported an outcome, so `attempts` is left unchanged;
    /// a job already at its cap still moves to the failed set.
    pub async fn reschedule_abandoned(
        &self,
        conn: &mut PgConnection,
        job: &Job,
        error: Option<&str>,
    ) -> Result<RescheduleOutcome, StoreError> {
        self.reschedule_on(conn, job, error, false).await
    }

    async fn reschedule_on(
        &self,
        conn: &mut PgConnection,
        job: &Job,
        error: Option<&str>,
        bump_attempts: bool,
    ) -> Result<RescheduleOutcome, StoreError> {
        let attempts = if bump_attempts {
            job.attempts + 1
        } else {
            job.attempts
        };
        if attempts >= job.effective_max_attempts(self.settings.max_attempts) {
            let failed = self.fail_job_on(conn, job.id, error).await?;
            return Ok(RescheduleOutcome::Failed(failed));
        }

        let run_at = backoff_run_at(Utc::now(), attempts);
        let result = sqlx::query(
            "UPDATE delayed_jobs \
             SET locked_at = NULL, locked_by = NULL, attempts = $2, run_at = $3, \
                 last_error = COALESCE($4, last_error), updated_at = now() \
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(attempts)
        .bind(run_at)
        .bind(error)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job.id));
        }
        Ok(RescheduleOutcome::Rescheduled { run_at })
    }

    /// Unlock jobs still held under any broker's prefetch identity whose
    /// lock is older than `older_than`. Covers brokers that died
    /// mid-prefetch; live brokers unlock their own buckets long before the
    /// horizon.
    pub async fn unlock_orphaned_prefetched_jobs(
        &self,
        older_than: Duration,
    ) -> Result<u64, StoreError> {
        let seconds = older_than.num_milliseconds() as f64 / 1000.0;
        let result = sqlx::query(
            "UPDATE delayed_jobs \
             SET locked_at = NULL, locked_by = NULL, updated_at = now() \
             WHERE locked_by LIKE $1 AND locked_at <= now() - make_interval(secs => $2)",
        )
        .bind(format!("{PREFETCH_PREFIX}%"))
        .bind(seconds)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
