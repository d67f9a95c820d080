//! Listing, counting, and bulk operations backing an external admin CLI.

use crate::job::{Flavor, Job, ON_HOLD_LOCKER};
use crate::store::{JobStore, StoreError, JOB_COLUMNS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    Hold,
    Unhold,
    Destroy,
}

/// What a bulk operation applies to: an explicit id list, or every job
/// matching a listing flavor.
#[derive(Debug, Clone)]
pub enum Selector<'a> {
    Ids(&'a [i64]),
    Matching {
        flavor: Flavor,
        query: Option<&'a str>,
    },
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TagCount {
    pub tag: String,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFlavor {
    Current,
    All,
}

/// Failed rows presented through the unified `Job` shape get fixed values
/// for the columns the failed table doesn't carry.
const FAILED_AS_JOB_COLUMNS: &str = "id, priority, attempts, max_attempts, queue, strand, \
     1 AS max_concurrent, TRUE AS next_in_strand, run_at, locked_at, locked_by, failed_at, \
     last_error, tag, source, payload, created_at, created_at AS updated_at";

impl JobStore {
    /// List jobs for the admin surface. `query` names the strand or tag for
    /// those flavors and is ignored otherwise.
    pub async fn list_jobs(
        &self,
        flavor: Flavor,
        limit: i64,
        offset: i64,
        query: Option<&str>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = match flavor {
            Flavor::Current => {
                sqlx::query_as::<_, Job>(&format!(
                    "SELECT {JOB_COLUMNS} FROM delayed_jobs \
                     WHERE run_at <= now() AND (locked_by IS NULL OR locked_by <> $1) \
                     ORDER BY priority ASC, run_at ASC, id ASC \
                     LIMIT $2 OFFSET $3"
                ))
                .bind(ON_HOLD_LOCKER)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?
            }
            Flavor::Future => {
                sqlx::query_as::<_, Job>(&format!(
                    "SELECT {JOB_COLUMNS} FROM delayed_jobs \
                     WHERE run_at > now() \
                     ORDER BY run_at ASC, id ASC \
                     LIMIT $1 OFFSET $2"
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?
            }
            Flavor::Failed => {
                sqlx::query_as::<_, Job>(&format!(
                    "SELECT {FAILED_AS_JOB_COLUMNS} FROM failed_jobs \
                     ORDER BY failed_at DESC, id DESC \
                     LIMIT $1 OFFSET $2"
                ))
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?
            }
            Flavor::Strand => {
                let strand = query.ok_or(StoreError::MissingFlavorQuery)?;
                sqlx::query_as::<_, Job>(&format!(
                    "SELECT {JOB_COLUMNS} FROM delayed_jobs \
                     WHERE strand = $1 \
                     ORDER BY id ASC \
                     LIMIT $2 OFFSET $3"
                ))
                .bind(strand)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?
            }
            Flavor::Tag => {
                let tag = query.ok_or(StoreError::MissingFlavorQuery)?;
                sqlx::query_as::<_, Job>(&format!(
                    "SELECT {JOB_COLUMNS} FROM delayed_jobs \
                     WHERE tag = $1 \
                     ORDER BY id ASC \
                     LIMIT $2 OFFSET $3"
                ))
                .bind(tag)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(jobs)
    }

    pub async fn jobs_count(
        &self,
        flavor: Flavor,
        query: Option<&str>,
    ) -> Result<i64, StoreError> {
        let count: (i64,) = match flavor {
            Flavor::Current => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM delayed_jobs \
                     WHERE run_at <= now() AND (locked_by IS NULL OR locked_by <> $1)",
                )
                .bind(ON_HOLD_LOCKER)
                .fetch_one(self.pool())
                .await?
            }
            Flavor::Future => {
                sqlx::query_as("SELECT COUNT(*) FROM delayed_jobs WHERE run_at > now()")
                    .fetch_one(self.pool())
                    .await?
            }
            Flavor::Failed => {
                sqlx::query_as("SELECT COUNT(*) FROM failed_jobs")
                    .fetch_one(self.pool())
                    .await?
            }
            Flavor::Strand => {
                let strand = query.ok_or(StoreError::MissingFlavorQuery)?;
                sqlx::query_as("SELECT COUNT(*) FROM delayed_jobs WHERE strand = $1")
                    .bind(strand)
                    .fetch_one(self.pool())
                    .await?
            }
            Flavor::Tag => {
                let tag = query.ok_or(StoreError::MissingFlavorQuery)?;
                sqlx::query_as("SELECT COUNT(*) FROM delayed_jobs WHERE tag = $1")
                    .bind(tag)
                    .fetch_one(self.pool())
                    .await?
            }
        };
        Ok(count.0)
    }

    /// Apply an admin action to the selected jobs. Returns the number of
    /// rows affected.
    pub async fn bulk_update(
        &self,
        action: BulkAction,
        selector: Selector<'_>,
    ) -> Result<u64, StoreError> {
        // Destroying failed jobs clears the failed table, not the active one.
        if let (
            BulkAction::Destroy,
            Selector::Matching {
                flavor: Flavor::Failed,
                ..
            },
        ) = (action, &selector)
        {
            let result = sqlx::query("DELETE FROM failed_jobs")
                .execute(self.pool())
                .await?;
            return Ok(result.rows_affected());
        }

        let ids = match selector {
            Selector::Ids(ids) => ids.to_vec(),
            Selector::Matching { flavor, query } => self.matching_ids(flavor, query).await?,
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let result = match action {
            BulkAction::Hold => {
                sqlx::query(
                    "UPDATE delayed_jobs \
                     SET locked_by = $2, locked_at = now(), updated_at = now() \
                     WHERE id = ANY($1)",
                )
                .bind(&ids)
                .bind(ON_HOLD_LOCKER)
                .execute(self.pool())
                .await?
            }
            BulkAction::Unhold => {
                sqlx::query(
                    "UPDATE delayed_jobs \
                     SET locked_by = NULL, locked_at = NULL, attempts = 0, \
                         run_at = GREATEST(run_at, now()), updated_at = now() \
                     WHERE id = ANY($1)",
                )
                .bind(&ids)
                .execute(self.pool())
                .await?
            }
            BulkAction::Destroy => {
                sqlx::query("DELETE FROM delayed_jobs WHERE id = ANY($1)")
                    .bind(&ids)
                    .execute(self.pool())
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    /// Tag histogram over due jobs (`Current`) or every active job (`All`),
    /// most frequent first.
    pub async fn tag_counts(
        &self,
        flavor: TagFlavor,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TagCount>, StoreError> {
        let counts = match flavor {
            TagFlavor::Current => {
                sqlx::query_as::<_, TagCount>(
                    "SELECT tag, COUNT(*) AS count FROM delayed_jobs \
                     WHERE tag IS NOT NULL AND run_at <= now() \
                       AND (locked_by IS NULL OR locked_by <> $1) \
                     GROUP BY tag \
                     ORDER BY count DESC, tag ASC \
                     LIMIT $2 OFFSET $3",
                )
                .bind(ON_HOLD_LOCKER)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?
            }
            TagFlavor::All => {
                sqlx::query_as::<_, TagCount>(
                    "SELECT tag, COUNT(*) AS count FROM delayed_jobs \
                     WHERE tag IS NOT NULL \
                     GROUP BY tag \
                     ORDER BY count DESC, tag ASC \
                     LIMIT $1 OFFSET $2",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool())
                .await?
            }
        };
        Ok(counts)
    }

    async fn matching_ids(
        &self,
        flavor: Flavor,
        query: Option<&str>,
    ) -> Result<Vec<i64>, StoreError> {
        let rows: Vec<(i64,)> = match flavor {
            Flavor::Current => {
                sqlx::query_as(
                    "SELECT id FROM delayed_jobs \
                     WHERE run_at <= now() AND (locked_by IS NULL OR locked_by <> $1)",
                )
                .bind(ON_HOLD_LOCKER)
                .fetch_all(self.pool())
                .await?
            }
            Flavor::Future => {
                sqlx::query_as("SELECT id FROM delayed_jobs WHERE run_at > now()")
                    .fetch_all(self.pool())
                    .await?
            }
            Flavor::Failed => {
                sqlx::query_as("SELECT id FROM failed_jobs")
                    .fetch_all(self.pool())
                    .await?
            }
            Flavor::Strand => {
                let strand = query.ok_or(StoreError::MissingFlavorQuery)?;
                sqlx::query_as("SELECT id FROM delayed_jobs WHERE strand = $1")
                    .bind(strand)
                    .fetch_all(self.pool())
                    .await?
            }
            Flavor::Tag => {
                let tag = query.ok_or(StoreError::MissingFlavorQuery)?;
                sqlx::query_as("SELECT id FROM delayed_jobs WHERE tag = $1")
                    .bind(tag)
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
