//! Wire protocol between the work queue server and its worker clients.
//!
//! Frames are length-prefixed with JSON bodies. A client sends exactly one
//! `WorkRequest` per idle cycle and never writes again until it has been
//! answered; the server answers each assignment with one serialized `Job`.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

/// Upper bound on a single frame; payloads are JSONB job rows.
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A worker's fetch criteria. Workers sharing the same tuple are batched
/// together by the server; `pool_size` only scales the prefetch amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub queue: String,
    #[serde(default)]
    pub min_priority: Option<i32>,
    #[serde(default)]
    pub max_priority: Option<i32>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    1
}

impl WorkerConfig {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            min_priority: None,
            max_priority: None,
            pool_size: default_pool_size(),
        }
    }

    pub fn key(&self) -> ConfigKey {
        ConfigKey {
            queue: self.queue.clone(),
            min_priority: self.min_priority,
            max_priority: self.max_priority,
            pool_size: self.pool_size,
        }
    }
}

/// Hashable identity of a worker config; partitions the server's waiting
/// lists and prefetch buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    pub queue: String,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    pub worker_name: String,
    pub config: WorkerConfig,
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(frame)?)
}
