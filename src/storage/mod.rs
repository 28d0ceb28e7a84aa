//! Storage Backend Module
//!
//! Defines the uniform capability interface through which operations touch
//! physical storage, plus the adapters shipped with the crate.
//!
//! ## Core Concepts
//! - **Capability trait**: `StorageBackend` exposes read/write/list/mkdir/delete/rename and
//!   path metadata. The queue never reimplements a backend; it only consumes this trait.
//! - **Registry**: `StorageRegistry` resolves a `StorageId` (as written in the op encoding)
//!   to a shared backend instance.
//! - **Retry**: `RetryPolicy` wraps backend calls with bounded, fixed-backoff retries.
//! - **Adapters**: `InMemoryStorage` (tests, dry runs) and `LocalFileStorage` (local disk).

pub mod backend;
pub mod local;
pub mod memory;
pub mod retry;
pub mod types;

pub use backend::{StorageBackend, StorageError, StorageRegistry};
pub use local::LocalFileStorage;
pub use memory::InMemoryStorage;
pub use retry::RetryPolicy;
pub use types::{PathInfo, StorageId};
