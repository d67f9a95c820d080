use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Top-level configuration. Every field has a serde default so a partial
/// TOML file (or none at all) yields a working configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Default queue name for enqueues that don't name one.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Default attempt cap for jobs without a row-level `max_attempts`.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    /// Default priority applied to enqueues that don't set one.
    #[serde(default)]
    pub default_priority: i32,
    /// Base broker loop timeout, seconds.
    #[serde(default = "default_sleep_delay")]
    pub sleep_delay: f64,
    /// Uniform random addition to the loop timeout, seconds.
    #[serde(default = "default_sleep_delay_stagger")]
    pub sleep_delay_stagger: f64,
    /// Jobs fetched per worker slot in one batch fetch.
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,
    /// Shuffle each locked batch before assigning it to workers.
    #[serde(default)]
    pub select_random_from_batch: bool,
    /// Whether the supervisor KILLs workers that outlive a slow exit.
    #[serde(default)]
    pub kill_workers_on_exit: bool,
    /// Seconds a QUIT-ing worker gets before the supervisor escalates.
    #[serde(default = "default_slow_exit_timeout")]
    pub slow_exit_timeout: u64,
    /// Suppress per-poll query logging on the hot fetch path.
    #[serde(default = "default_silence_polling")]
    pub silence_polling: bool,
    /// Sub-strand counts for n-strand names. Absent names fan out to 1.
    #[serde(default)]
    pub num_strands: HashMap<String, u32>,
    #[serde(default)]
    pub worker_health_check: HealthCheckConfig,
    #[serde(default)]
    pub parent_process: ParentProcessConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Liveness oracle selection for the health reaper. `None` disables the
/// reaper entirely; `Static` reads a fixed list from configuration (other
/// oracles plug in through the `LivenessOracle` trait).
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheckConfig {
    #[default]
    None,
    Static {
        #[serde(default)]
        live_workers: Vec<String>,
    },
}

/// Settings for the per-host work queue server and its clients.
#[derive(Debug, Deserialize, Clone)]
pub struct ParentProcessConfig {
    /// Unix-domain socket path the broker listens on.
    #[serde(default = "default_server_address")]
    pub server_address: PathBuf,
    /// Deadline for any single write to a worker socket, seconds.
    #[serde(default = "default_server_socket_timeout")]
    pub server_socket_timeout: f64,
    /// Age at which an unclaimed prefetch bucket is unlocked, seconds.
    #[serde(default = "default_prefetched_jobs_timeout")]
    pub prefetched_jobs_timeout: f64,
    /// Worker-side connect deadline, seconds.
    #[serde(default = "default_client_connect_timeout")]
    pub client_connect_timeout: f64,
}

impl Default for ParentProcessConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            server_socket_timeout: default_server_socket_timeout(),
            prefetched_jobs_timeout: default_prefetched_jobs_timeout(),
            client_connect_timeout: default_client_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Apply pending migrations at startup. Off by default; production
    /// schemas are usually migrated out of band.
    #[serde(default)]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            run_migrations: false,
        }
    }
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_max_attempts() -> i32 {
    15
}

fn default_sleep_delay() -> f64 {
    2.0
}

fn default_sleep_delay_stagger() -> f64 {
    2.0
}

fn default_fetch_batch_size() -> usize {
    5
}

fn default_slow_exit_timeout() -> u64 {
    20
}

fn default_silence_polling() -> bool {
    true
}

fn default_server_address() -> PathBuf {
    PathBuf::from("tmp/braid.sock")
}

fn default_server_socket_timeout() -> f64 {
    10.0
}

fn default_prefetched_jobs_timeout() -> f64 {
    30.0
}

fn default_client_connect_timeout() -> f64 {
    2.0
}

fn default_database_url() -> String {
    "postgres://localhost/braid_development".to_string()
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("queue name must not be empty")]
    EmptyQueue,
    #[error("max_attempts must be at least 1, got {0}")]
    MaxAttempts(i32),
    #[error("fetch_batch_size must be at least 1")]
    FetchBatchSize,
    #[error("sleep_delay and sleep_delay_stagger must be non-negative")]
    NegativeDelay,
}

impl Default for Settings {
    fn default() -> Self {
        // serde defaults double as the programmatic defaults
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl Settings {
    /// Load settings from a TOML file, or the defaults when no path is
    /// given. Validation failures are programmer/operator errors and fail
    /// fast.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                toml::from_str(&data)?
            }
            None => Self::default(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.is_empty() {
            return Err(ConfigError::EmptyQueue);
        }
        if self.max_attempts < 1 {
            return Err(ConfigError::MaxAttempts(self.max_attempts));
        }
        if self.fetch_batch_size < 1 {
            return Err(ConfigError::FetchBatchSize);
        }
        if self.sleep_delay < 0.0 || self.sleep_delay_stagger < 0.0 {
            return Err(ConfigError::NegativeDelay);
        }
        Ok(())
    }

    /// Sub-strand count for an n-strand name, trying the full
    /// `name/discriminator` form before the bare name.
    pub fn num_strands_for(&self, name: &str) -> u32 {
        if let Some(n) = self.num_strands.get(name) {
            return *n;
        }
        let base = name.split('/').next().unwrap_or(name);
        self.num_strands.get(base).copied().unwrap_or(1)
    }
}
