//! Job row types and enqueue options.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Locker identity for administratively held jobs. Held jobs are excluded
/// from every read path except explicit admin operations.
pub const ON_HOLD_LOCKER: &str = "on hold";

/// Locker identity the health reaper installs while reclaiming a job from a
/// dead worker.
pub const ABANDONED_LOCKER: &str = "abandoned job cleanup";

/// Prefix of broker-owned prefetch locks; the suffix is the broker's host.
pub const PREFETCH_PREFIX: &str = "prefetch:";

/// A persisted job row. `next_in_strand` is maintained by the store's
/// triggers and must never be written by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: Option<i32>,
    pub queue: String,
    pub strand: Option<String>,
    pub max_concurrent: i32,
    pub next_in_strand: bool,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub tag: Option<String>,
    pub source: Option<String>,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    pub fn on_hold(&self) -> bool {
        self.locked_by.as_deref() == Some(ON_HOLD_LOCKER)
    }

    /// True when the lock is held by a broker that has not yet assigned the
    /// job to a worker.
    pub fn prefetched(&self) -> bool {
        self.locked_by
            .as_deref()
            .is_some_and(|l| l.starts_with(PREFETCH_PREFIX))
    }

    /// The attempt cap for this job, falling back to the configured default.
    pub fn effective_max_attempts(&self, default_max_attempts: i32) -> i32 {
        self.max_attempts.unwrap_or(default_max_attempts)
    }
}

/// A terminally failed job. Lives in the failed set; the active row with id
/// `original_job_id` was deleted in the same transaction that created this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FailedJob {
    pub id: i64,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: Option<i32>,
    pub queue: String,
    pub strand: Option<String>,
    pub run_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub tag: Option<String>,
    pub source: Option<String>,
    pub payload: JsonValue,
    pub original_job_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Options for a single enqueue. Unset fields fall back to the configured
/// defaults when the store inserts the row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: Option<String>,
    pub priority: Option<i32>,
    pub run_at: Option<DateTime<Utc>>,
    pub strand: Option<String>,
    pub n_strand: Option<String>,
    pub max_concurrent: i32,
    pub singleton: bool,
    pub max_attempts: Option<i32>,
    pub tag: Option<String>,
    pub source: Option<String>,
    pub payload: JsonValue,
}

impl NewJob {
    pub fn new(payload: JsonValue) -> Self {
        Self {
            queue: None,
            priority: None,
            run_at: None,
            strand: None,
            n_strand: None,
            max_concurrent: 1,
            singleton: false,
            max_attempts: None,
            tag: None,
            source: None,
            payload,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn strand(mut self, strand: impl Into<String>) -> Self {
        self.strand = Some(strand.into());
        self
    }

    /// Fan the job out over a configured number of sub-strands. The argument
    /// is a strand name, optionally with a `/`-separated discriminator.
    pub fn n_strand(mut self, name: impl Into<String>) -> Self {
        self.n_strand = Some(name.into());
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: i32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Coalesce with an existing unlocked job on the same strand instead of
    /// inserting a duplicate. Requires a strand.
    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }

    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Listing flavors for the admin surface. `Strand` and `Tag` filter by the
/// accompanying query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Current,
    Future,
    Failed,
    Strand,
    Tag,
}

/// Time of the next attempt after `attempts` failures: a quartic backoff
/// with a five second floor.
pub fn backoff_run_at(now: DateTime<Utc>, attempts: i32) -> DateTime<Utc> {
    let delay = (i64::from(attempts)).pow(4) + 5;
    now + Duration::seconds(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_quartically() {
        let now = Utc::now();
        assert_eq!(backoff_run_at(now, 1), now + Duration::seconds(6));
        assert_eq!(backoff_run_at(now, 2), now + Duration::seconds(21));
        assert_eq!(backoff_run_at(now, 10), now + Duration::seconds(10_005));
    }

    #[test]
    fn effective_max_attempts_prefers_row_value() {
        let mut job = sample_job();
        assert_eq!(job.effective_max_attempts(15), 15);
        job.max_attempts = Some(3);
        assert_eq!(job.effective_max_attempts(15), 3);
    }

    #[test]
    fn prefetched_matches_prefix_only() {
        let mut job = sample_job();
        job.locked_by = Some("prefetch:host-a".to_string());
        assert!(job.prefetched());
        job.locked_by = Some("worker-1".to_string());
        assert!(!job.prefetched());
    }

    fn sample_job() -> Job {
        let now = Utc::now();
        Job {
            id: 1,
            priority: 0,
            attempts: 0,
            max_attempts: None,
            queue: "default".to_string(),
            strand: None,
            max_concurrent: 1,
            next_in_strand: true,
            run_at: now,
            locked_at: None,
            locked_by: None,
            failed_at: None,
            last_error: None,
            tag: None,
            source: None,
            payload: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }
}
