//! Runtime configuration.
//!
//! Plain structs with defaults. The binary reads an optional JSON settings file
//! (every field may be omitted) and then overrides a handful of fields from
//! command-line flags. All durations serialize as milliseconds.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub use crate::storage::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Keep completed operations in memory until `purge_done_ops` is called.
    pub keep_done_ops: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            keep_done_ops: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Buffered log records are flushed once this much time has passed since the last flush.
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    pub done_file: String,
    pub error_file: String,
    pub remaining_ops_file: String,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            done_file: "done.log".to_string(),
            error_file: "error.log".to_string(),
            remaining_ops_file: "remaining-ops.txt".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_ops: usize,
    /// Soft budget on the pre-estimated `io_read_len + io_write_len` of one batch.
    pub max_batch_bytes: u64,
    pub max_parallel_batches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_ops: 100,
            max_batch_bytes: 64 * 1024 * 1024,
            max_parallel_batches: 4,
        }
    }
}

impl BatchConfig {
    /// One operation per dispatch.
    pub fn single_op(max_parallel: usize) -> Self {
        Self {
            max_batch_ops: 1,
            max_batch_bytes: u64::MAX,
            max_parallel_batches: max_parallel,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// A session silent for longer than this is declared dead.
    #[serde(with = "duration_millis")]
    pub liveness_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub check_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(60),
            check_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub thread_count: usize,
    /// Extra tasks polled beyond `thread_count` so workers never wait on a round trip.
    pub poll_ahead: usize,
    #[serde(with = "duration_millis")]
    pub ping_alive_interval: Duration,
    /// Wait after a poll that returned no work, unless woken earlier.
    #[serde(with = "duration_millis")]
    pub idle_poll_interval: Duration,
    /// Wait before re-sending after a transport failure.
    #[serde(with = "duration_millis")]
    pub transport_retry_delay: Duration,
    pub chunk_size: u64,
    pub retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            thread_count: 4,
            poll_ahead: 2,
            ping_alive_interval: Duration::from_secs(15),
            idle_poll_interval: Duration::from_secs(1),
            transport_retry_delay: Duration::from_secs(1),
            chunk_size: 4 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// Everything a node can be configured with, as read from a settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub queue: QueueConfig,
    pub persist: PersistConfig,
    pub batch: BatchConfig,
    pub session: SessionConfig,
    pub executor: ExecutorConfig,
}

impl Settings {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
