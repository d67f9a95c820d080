//! Orphan-lock recovery for dead workers.
//!
//! Workers that crash or are KILLed leave their jobs locked. The health
//! reaper compares the set of lock owners against a liveness oracle and
//! reclaims jobs whose owner is gone. Sweeps are serialized cluster-wide by
//! a session-level advisory lock, and each reclamation is a two-step
//! CAS-then-reschedule in one transaction: a worker that returned from the
//! dead between the liveness check and the update keeps its lock.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::job::{Job, ABANDONED_LOCKER, PREFETCH_PREFIX};
use crate::settings::HealthCheckConfig;
use crate::store::{JobStore, RescheduleOutcome, StoreError};
use crate::strand::HEALTH_CHECK_LOCK_KEY;

/// Source of truth for which worker identities are alive; typically a
/// service registry.
#[async_trait]
pub trait LivenessOracle: Send + Sync {
    async fn live_workers(&self) -> anyhow::Result<HashSet<String>>;
}

/// Fixed live list from configuration. Useful for tests and deployments
/// where the worker set is static.
pub struct StaticLiveness {
    live: HashSet<String>,
}

impl StaticLiveness {
    pub fn new(workers: impl IntoIterator<Item = String>) -> Self {
        Self {
            live: workers.into_iter().collect(),
        }
    }
}

#[async_trait]
impl LivenessOracle for StaticLiveness {
    async fn live_workers(&self) -> anyhow::Result<HashSet<String>> {
        Ok(self.live.clone())
    }
}

/// Build the configured oracle. `None` means health checking is disabled
/// and no reaper should run.
pub fn oracle_from_settings(config: &HealthCheckConfig) -> Option<Arc<dyn LivenessOracle>> {
    match config {
        HealthCheckConfig::None => None,
        HealthCheckConfig::Static { live_workers } => Some(Arc::new(StaticLiveness::new(
            live_workers.iter().cloned(),
        ))),
    }
}

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("liveness oracle failed: {0}")]
    Oracle(anyhow::Error),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReapStats {
    /// Running jobs whose owner was absent from the live set.
    pub examined: usize,
    /// Jobs actually reclaimed (CAS won) and rescheduled or failed.
    pub reclaimed: usize,
    /// Per-job errors; logged, never aborting the sweep.
    pub errors: usize,
}

pub struct HealthReaper {
    store: JobStore,
    oracle: Arc<dyn LivenessOracle>,
}

impl HealthReaper {
    pub fn new(store: JobStore, oracle: Arc<dyn LivenessOracle>) -> Self {
        Self { store, oracle }
    }

    /// Run one sweep. Returns `None` when another reaper holds the
    /// cluster-wide advisory lock.
    pub async fn sweep(&self) -> Result<Option<ReapStats>, ReaperError> {
        let mut conn = self.store.pool().acquire().await?;
        let (acquired,): (bool,) =
            sqlx::query_as("SELECT pg_try_advisory_lock(half_md5_as_bigint($1))")
                .bind(HEALTH_CHECK_LOCK_KEY)
                .fetch_one(&mut *conn)
                .await?;
        if !acquired {
            debug!("another health reaper holds the lock, skipping sweep");
            return Ok(None);
        }

        let result = self.sweep_locked(&mut conn).await;
        let unlock = sqlx::query("SELECT pg_advisory_unlock(half_md5_as_bigint($1))")
            .bind(HEALTH_CHECK_LOCK_KEY)
            .execute(&mut *conn)
            .await;
        if let Err(err) = unlock {
            warn!(error = %err, "failed to release the health check advisory lock");
        }
        result.map(Some)
    }

    async fn sweep_locked(&self, conn: &mut PgConnection) -> Result<ReapStats, ReaperError> {
        let live = self
            .oracle
            .live_workers()
            .await
            .map_err(ReaperError::Oracle)?;
        let running = self.store.running_jobs().await?;

        let mut stats = ReapStats::default();
        for job in running {
            let Some(owner) = job.locked_by.clone() else {
                continue;
            };
            // Broker-owned prefetches have their own sweep.
            if owner.starts_with(PREFETCH_PREFIX) {
                continue;
            }
            if live.contains(&owner) {
                continue;
            }
            stats.examined += 1;
            match self.reclaim(conn, &job, &owner).await {
                Ok(true) => stats.reclaimed += 1,
                // The worker returned from the dead; the CAS left its lock alone.
                Ok(false) => {}
                Err(err) => {
                    stats.errors += 1;
                    warn!(job_id = job.id, worker = %owner, error = %err, "failed to reclaim job");
                }
            }
        }
        if stats.reclaimed > 0 {
            info!(
                reclaimed = stats.reclaimed,
                examined = stats.examined,
                "health reaper reclaimed abandoned jobs"
            );
        }
        Ok(stats)
    }

    async fn reclaim(
        &self,
        conn: &mut PgConnection,
        job: &Job,
        owner: &str,
    ) -> Result<bool, ReaperError> {
        let mut tx = conn.begin().await?;
        let claimed = sqlx::query(
            "UPDATE delayed_jobs \
             SET locked_by = $2, updated_at = now() \
             WHERE id = $1 AND locked_by = $3",
        )
        .bind(job.id)
        .bind(ABANDONED_LOCKER)
        .bind(owner)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let error = format!("worker {owner} died without reporting an outcome");
        match self
            .store
            .reschedule_abandoned(&mut tx, job, Some(&error))
            .await?
        {
            RescheduleOutcome::Rescheduled { run_at } => {
                debug!(job_id = job.id, worker = %owner, %run_at, "rescheduled abandoned job");
            }
            RescheduleOutcome::Failed(_) => {
                debug!(job_id = job.id, worker = %owner, "abandoned job was at its attempt cap, failed");
            }
        }
        tx.commit().await?;
        Ok(true)
    }
}
