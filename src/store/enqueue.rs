//! Job enqueue operations.

use chrono::Utc;
use sqlx::PgConnection;
use tracing::debug;

use crate::job::{Job, NewJob};
use crate::store::{JobStore, StoreError, JOB_COLUMNS};
use crate::strand;

impl JobStore {
    /// Enqueue a job in its own transaction.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let mut tx = self.pool().begin().await?;
        let job = self.enqueue_in(&mut tx, new_job).await?;
        tx.commit().await?;
        Ok(job)
    }

    /// Enqueue a job within the caller's transaction, so the enqueue commits
    /// or rolls back with the caller's own writes.
    ///
    /// Stranded inserts take the per-strand advisory lock before the INSERT;
    /// the insert trigger's own lock acquisition is then a re-entrant no-op
    /// instead of an in-trigger upgrade, which is what keeps concurrent
    /// stranded enqueues deadlock-free.
    pub async fn enqueue_in(
        &self,
        conn: &mut PgConnection,
        new_job: NewJob,
    ) -> Result<Job, StoreError> {
        let queue = new_job
            .queue
            .clone()
            .unwrap_or_else(|| self.settings().queue.clone());
        if queue.is_empty() {
            return Err(StoreError::EmptyQueue);
        }
        let strand_name = match (&new_job.strand, &new_job.n_strand) {
            (Some(s), _) => Some(s.clone()),
            (None, Some(n)) => Some(strand::resolve_n_strand(self.settings(), n)),
            (None, None) => None,
        };
        if new_job.singleton && strand_name.is_none() {
            return Err(StoreError::SingletonWithoutStrand);
        }
        let priority = new_job
            .priority
            .unwrap_or(self.settings().default_priority);
        let run_at = new_job.run_at.unwrap_or_else(Utc::now);

        if let Some(strand_name) = &strand_name {
            sqlx::query("SELECT pg_advisory_xact_lock(half_md5_as_bigint($1))")
                .bind(strand_name)
                .execute(&mut *conn)
                .await?;

            if new_job.singleton {
                // Coalesce with the oldest pending job on the strand, if
                // any, pulling its run_at forward. A running (locked) job
                // does not count; one running plus one pending may coexist.
                let existing = sqlx::query_as::<_, Job>(&format!(
                    "SELECT {JOB_COLUMNS} FROM delayed_jobs \
                     WHERE strand = $1 AND locked_at IS NULL \
                     ORDER BY id ASC LIMIT 1"
                ))
                .bind(strand_name)
                .fetch_optional(&mut *conn)
                .await?;

                if let Some(existing) = existing {
                    let job = sqlx::query_as::<_, Job>(&format!(
                        "UPDATE delayed_jobs \
                         SET run_at = LEAST(run_at, $2), updated_at = now() \
                         WHERE id = $1 \
                         RETURNING {JOB_COLUMNS}"
                    ))
                    .bind(existing.id)
                    .bind(run_at)
                    .fetch_one(&mut *conn)
                    .await?;
                    debug!(strand = %strand_name, job_id = job.id, "singleton enqueue coalesced");
                    return Ok(job);
                }
            }
        }

        let job = sqlx::query_as::<_, Job>(&format!(
            "INSERT INTO delayed_jobs \
                 (queue, priority, run_at, strand, max_concurrent, max_attempts, tag, \
                  source, payload) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(&queue)
        .bind(priority)
        .bind(run_at)
        .bind(&strand_name)
        .bind(new_job.max_concurrent)
        .bind(new_job.max_attempts)
        .bind(&new_job.tag)
        .bind(&new_job.source)
        .bind(&new_job.payload)
        .fetch_one(&mut *conn)
        .await?;
        Ok(job)
    }
}
