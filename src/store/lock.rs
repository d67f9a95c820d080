//! Lock acquisition, transfer, release, and the batched fetch-and-lock the
//! work queue server runs on behalf of waiting workers.

use std::collections::HashMap;

use rand::seq::SliceRandom;

use crate::job::Job;
use crate::store::{JobStore, StoreError, JOB_COLUMNS};

/// Result of a batched fetch: at most one job per requesting worker, plus
/// the overflow locked under the prefetch owner identity. Workers that
/// received nothing are absent from `assigned`.
#[derive(Debug, Default)]
pub struct LockedJobs {
    pub assigned: HashMap<String, Job>,
    pub prefetched: Vec<Job>,
}

impl LockedJobs {
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty() && self.prefetched.is_empty()
    }
}

impl JobStore {
    /// Try to lock a single job for a worker. Returns false when the job is
    /// already locked or not yet runnable. Strand eligibility is not
    /// re-checked here; `next_in_strand` was enforced when the job was
    /// selected.
    pub async fn lock_exclusively(&self, id: i64, worker: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE delayed_jobs \
             SET locked_at = now(), locked_by = $2, updated_at = now() \
             WHERE id = $1 AND locked_at IS NULL AND run_at <= now()",
        )
        .bind(id)
        .bind(worker)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Hand a held lock from one owner to another. Returns false when `from`
    /// no longer holds the lock (e.g. the health reaper reclaimed it).
    pub async fn transfer_lock(&self, id: i64, from: &str, to: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE delayed_jobs \
             SET locked_at = now(), locked_by = $3, updated_at = now() \
             WHERE id = $1 AND locked_by = $2",
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Unconditionally release the listed locks.
    pub async fn unlock(&self, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE delayed_jobs \
             SET locked_at = NULL, locked_by = NULL, updated_at = now() \
             WHERE id = ANY($1)",
        )
        .bind(ids)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Fetch and lock up to `workers.len() + prefetch` ready jobs in one
    /// transactional pass: one job per worker, by position, and the
    /// remainder locked under `prefetch_owner`.
    ///
    /// Selection order is `(priority, run_at, id)`; with
    /// `select_random_from_batch` the locked batch is shuffled before
    /// assignment. `FOR UPDATE SKIP LOCKED` keeps concurrent fetchers from
    /// handing the same job to two workers.
    pub async fn get_and_lock_next_available(
        &self,
        workers: &[String],
        queue: &str,
        min_priority: Option<i32>,
        max_priority: Option<i32>,
        prefetch: usize,
        prefetch_owner: &str,
    ) -> Result<LockedJobs, StoreError> {
        let limit = workers.len() + prefetch;
        let mut locked = LockedJobs::default();
        if limit == 0 {
            return Ok(locked);
        }

        let mut tx = self.pool().begin().await?;
        let mut batch = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM delayed_jobs \
             WHERE queue = $1 AND priority >= $2 AND priority <= $3 \
               AND run_at <= now() AND locked_at IS NULL AND next_in_strand \
             ORDER BY priority ASC, run_at ASC, id ASC \
             LIMIT $4 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(queue)
        .bind(min_priority.unwrap_or(i32::MIN))
        .bind(max_priority.unwrap_or(i32::MAX))
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        if batch.is_empty() {
            tx.commit().await?;
            return Ok(locked);
        }
        if self.settings().select_random_from_batch {
            batch.shuffle(&mut rand::thread_rng());
        }

        let mut batch = batch.into_iter();
        for worker in workers {
            let Some(job) = batch.next() else { break };
            let job = sqlx::query_as::<_, Job>(&format!(
                "UPDATE delayed_jobs \
                 SET locked_at = now(), locked_by = $2, updated_at = now() \
                 WHERE id = $1 \
                 RETURNING {JOB_COLUMNS}"
            ))
            .bind(job.id)
            .bind(worker)
            .fetch_one(&mut *tx)
            .await?;
            locked.assigned.insert(worker.clone(), job);
        }

        let rest: Vec<i64> = batch.map(|job| job.id).collect();
        if !rest.is_empty() {
            locked.prefetched = sqlx::query_as::<_, Job>(&format!(
                "UPDATE delayed_jobs \
                 SET locked_at = now(), locked_by = $2, updated_at = now() \
                 WHERE id = ANY($1) \
                 RETURNING {JOB_COLUMNS}"
            ))
            .bind(&rest)
            .bind(prefetch_owner)
            .fetch_all(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(locked)
    }
}
