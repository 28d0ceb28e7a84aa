//! I/O Cost Model
//!
//! Every operation declares a cheap, I/O-free **pre-estimate** of the work it
//! will do, and reports the **measured** cost once it has run. Both are keyed
//! per physical storage backend so operators can see which backend is the
//! bottleneck.
//!
//! ## Submodules
//! - **`types`**: `IoCost` counters and the per-storage `PerStorageCost` map
//!   (pointwise sum, checked decrement).
//! - **`tracker`**: cumulative measured cost and throughput per backend.

pub mod tracker;
pub mod types;

pub use tracker::{StorageIoTracker, StorageThroughput};
pub use types::{CostUnderflow, IoCost, PerStorageCost};
