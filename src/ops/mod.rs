//! Storage Operations
//!
//! An operation is one immutable unit of storage-mutating work, identified by
//! `(job_id, task_id)`. The variant set is closed: estimation, execution and the
//! wire encoding all dispatch with an exhaustive `match`.
//!
//! ## Submodules
//! - **`types`**: `Operation`, `OpKind`, `ExecutionResult` and the id newtypes.
//! - **`execute`**: I/O-free cost pre-estimates and execution against the storage
//!   registry, reporting the measured cost per backend.
//! - **`codec`**: the `:`-delimited text protocol used to enqueue and persist op lists.

pub mod codec;
pub mod execute;
pub mod types;

pub use codec::{CodecError, OpsReader, decode_ops, encode_op, encode_ops};
pub use execute::ExecutionContext;
pub use types::{ExecutionResult, JobId, OpKind, Operation, TaskId, ZipEntry, now_ms};
