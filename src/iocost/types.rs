use crate::storage::StorageId;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};
use thiserror::Error;

/// Counters describing the I/O done (or expected) against one storage backend.
///
/// `elapsed_millis` is only filled in for measured costs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IoCost {
    pub elapsed_millis: u64,
    pub io_read_len: u64,
    pub io_write_len: u64,
    pub call_count: u64,
    pub metadata_read_count: u64,
    pub metadata_write_count: u64,
}

/// Raised when a decrement would take a counter below zero. Always a bookkeeping defect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cost underflow on {storage_id}.{field}: {current} - {decrement}")]
pub struct CostUnderflow {
    pub storage_id: StorageId,
    pub field: &'static str,
    pub current: u64,
    pub decrement: u64,
}

impl IoCost {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Bytes moved in either direction; this is what batch budgets are checked against.
    pub fn io_len(&self) -> u64 {
        self.io_read_len.saturating_add(self.io_write_len)
    }

    fn fields(&self) -> [(&'static str, u64); 6] {
        [
            ("elapsed_millis", self.elapsed_millis),
            ("io_read_len", self.io_read_len),
            ("io_write_len", self.io_write_len),
            ("call_count", self.call_count),
            ("metadata_read_count", self.metadata_read_count),
            ("metadata_write_count", self.metadata_write_count),
        ]
    }

    fn checked_sub(&self, other: &IoCost, storage_id: &StorageId) -> Result<IoCost, CostUnderflow> {
        for ((field, current), (_, decrement)) in self.fields().into_iter().zip(other.fields()) {
            if decrement > current {
                return Err(CostUnderflow {
                    storage_id: storage_id.clone(),
                    field,
                    current,
                    decrement,
                });
            }
        }
        Ok(IoCost {
            elapsed_millis: self.elapsed_millis - other.elapsed_millis,
            io_read_len: self.io_read_len - other.io_read_len,
            io_write_len: self.io_write_len - other.io_write_len,
            call_count: self.call_count - other.call_count,
            metadata_read_count: self.metadata_read_count - other.metadata_read_count,
            metadata_write_count: self.metadata_write_count - other.metadata_write_count,
        })
    }
}

impl AddAssign<&IoCost> for IoCost {
    fn add_assign(&mut self, other: &IoCost) {
        self.elapsed_millis = self.elapsed_millis.saturating_add(other.elapsed_millis);
        self.io_read_len = self.io_read_len.saturating_add(other.io_read_len);
        self.io_write_len = self.io_write_len.saturating_add(other.io_write_len);
        self.call_count = self.call_count.saturating_add(other.call_count);
        self.metadata_read_count = self
            .metadata_read_count
            .saturating_add(other.metadata_read_count);
        self.metadata_write_count = self
            .metadata_write_count
            .saturating_add(other.metadata_write_count);
    }
}

/// Cost keyed by storage backend. Used both for pre-estimates and measured costs.
///
/// All-zero entries are never stored, so two maps describing the same cost
/// compare equal regardless of how they were built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerStorageCost {
    pub by_storage: BTreeMap<StorageId, IoCost>,
}

impl PerStorageCost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(storage_id: StorageId, cost: IoCost) -> Self {
        let mut result = Self::new();
        result.add_for(&storage_id, &cost);
        result
    }

    pub fn is_empty(&self) -> bool {
        self.by_storage.is_empty()
    }

    /// Counters for one backend; zero if the backend was never touched.
    pub fn get(&self, storage_id: &StorageId) -> IoCost {
        self.by_storage.get(storage_id).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StorageId, &IoCost)> {
        self.by_storage.iter()
    }

    pub fn add_for(&mut self, storage_id: &StorageId, cost: &IoCost) {
        if cost.is_zero() {
            return;
        }
        *self.by_storage.entry(storage_id.clone()).or_default() += cost;
    }

    /// Pointwise sum.
    pub fn incr(&mut self, other: &PerStorageCost) {
        for (storage_id, cost) in other.iter() {
            self.add_for(storage_id, cost);
        }
    }

    /// Pointwise difference. Leaves `self` untouched on underflow.
    pub fn decr(&mut self, other: &PerStorageCost) -> Result<(), CostUnderflow> {
        let mut updated = Vec::with_capacity(other.by_storage.len());
        for (storage_id, cost) in other.iter() {
            let current = self.get(storage_id);
            updated.push((storage_id.clone(), current.checked_sub(cost, storage_id)?));
        }
        for (storage_id, cost) in updated {
            if cost.is_zero() {
                self.by_storage.remove(&storage_id);
            } else {
                self.by_storage.insert(storage_id, cost);
            }
        }
        Ok(())
    }

    pub fn merged(&self, other: &PerStorageCost) -> PerStorageCost {
        let mut result = self.clone();
        result.incr(other);
        result
    }

    /// Sum over all backends.
    pub fn total(&self) -> IoCost {
        let mut total = IoCost::default();
        for cost in self.by_storage.values() {
            total += cost;
        }
        total
    }
}

impl Add<&PerStorageCost> for PerStorageCost {
    type Output = PerStorageCost;

    fn add(mut self, other: &PerStorageCost) -> PerStorageCost {
        self.incr(other);
        self
    }
}

impl AddAssign<&PerStorageCost> for PerStorageCost {
    fn add_assign(&mut self, other: &PerStorageCost) {
        self.incr(other);
    }
}

impl<'a> std::iter::Sum<&'a PerStorageCost> for PerStorageCost {
    fn sum<I: Iterator<Item = &'a PerStorageCost>>(iter: I) -> Self {
        iter.fold(PerStorageCost::new(), |acc, cost| acc + cost)
    }
}
