//! Cumulative per-backend I/O accounting.
//!
//! Fed with the measured cost of every executed operation; reports totals and
//! the effective read/write throughput of each storage backend.

use super::types::{IoCost, PerStorageCost};
use crate::storage::StorageId;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct StorageIoStats {
    total: IoCost,
    op_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageThroughput {
    pub storage_id: StorageId,
    pub total: IoCost,
    pub op_count: u64,
    /// Bytes per second of backend time; zero until some time was measured.
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
}

#[derive(Default)]
pub struct StorageIoTracker {
    stats: DashMap<StorageId, StorageIoStats>,
}

impl StorageIoTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, measured: &PerStorageCost) {
        for (storage_id, cost) in measured.iter() {
            let mut entry = self.stats.entry(storage_id.clone()).or_default();
            entry.total += cost;
            entry.op_count += 1;
        }
    }

    pub fn total_for(&self, storage_id: &StorageId) -> IoCost {
        self.stats
            .get(storage_id)
            .map(|entry| entry.total)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<StorageThroughput> {
        let mut result: Vec<StorageThroughput> = self
            .stats
            .iter()
            .map(|entry| {
                let stats = entry.value();
                let secs = stats.total.elapsed_millis as f64 / 1000.0;
                let rate = |bytes: u64| if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
                StorageThroughput {
                    storage_id: entry.key().clone(),
                    total: stats.total,
                    op_count: stats.op_count,
                    read_bytes_per_sec: rate(stats.total.io_read_len),
                    write_bytes_per_sec: rate(stats.total.io_write_len),
                }
            })
            .collect();
        result.sort_by(|a, b| a.storage_id.cmp(&b.storage_id));
        result
    }
}
