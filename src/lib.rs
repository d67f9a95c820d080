//! braid - a strand-ordered persistent job queue.
//!
//! Jobs live in a shared PostgreSQL table. Jobs sharing a *strand* execute
//! in insertion order (or with bounded concurrency for n-strands), enforced
//! by database triggers and per-strand advisory locks so every writer
//! observes the same invariants. A per-host broker process serves workers
//! over a Unix-domain socket, batching fetches and prefetching locks to
//! amortize database round-trips; a health reaper recovers locks held by
//! dead workers.

pub mod broker;
pub mod hooks;
pub mod job;
pub mod reaper;
pub mod settings;
pub mod store;
pub mod strand;
pub mod trace;
pub mod worker;

pub use broker::protocol::{WorkRequest, WorkerConfig};
pub use broker::{BrokerError, WorkQueueServer};
pub use hooks::{Callbacks, Event, EventKind};
pub use job::{FailedJob, Flavor, Job, NewJob};
pub use reaper::{HealthReaper, LivenessOracle, ReapStats, StaticLiveness};
pub use settings::{ConfigError, Settings};
pub use store::{
    BulkAction, JobStore, LockedJobs, RescheduleOutcome, Selector, StoreError, TagCount, TagFlavor,
};
pub use worker::{JobOutcome, JobRunner, Worker, WorkerError};
