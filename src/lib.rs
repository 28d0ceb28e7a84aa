//! Distributed Storage Operations Library
//!
//! Queues, distributes and executes storage-mutating operations (mkdir, file
//! copy, zip packing) against pluggable storage backends, with per-backend I/O
//! cost accounting. It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//!
//! - **`executor`**: per-job execution queues, persistence, the local batch poller,
//!   and the server/executor polling protocol with session liveness and failover.
//! - **`ops`**: the operation model, its cost pre-estimation and execution, and the
//!   line-oriented text encoding of operation lists.
//! - **`iocost`**: per-storage I/O counters and cumulative throughput tracking.
//! - **`storage`**: the blocking backend contract with in-memory and local-disk
//!   implementations, plus retry of transient failures.
//! - **`config`**: runtime configuration with defaults.

pub mod config;
pub mod executor;
pub mod iocost;
pub mod ops;
pub mod storage;
