use crate::iocost::PerStorageCost;
use crate::ops::{ExecutionResult, JobId, Operation, TaskId};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Lifecycle state of a task inside one job queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpState {
    /// Waiting to be polled. Re-queued tasks sit at the front.
    Queued,
    /// Handed out to a runner or executor session, awaiting its result.
    Running,
    /// Finished without error (possibly with warnings).
    Done,
    /// Finished with an error or an unexpected fault; held for manual retry.
    Error,
}

/// A successfully executed operation retained for audit until purged.
#[derive(Debug, Clone)]
pub struct DoneOp {
    pub op: Arc<Operation>,
    pub result: ExecutionResult,
}

/// A failed operation. `result` is `None` when the failure escaped execution
/// entirely, so no cost is known.
#[derive(Debug, Clone)]
pub struct ErrorOp {
    pub op: Arc<Operation>,
    pub error_message: String,
    pub result: Option<ExecutionResult>,
}

/// Point-in-time view of one job queue, taken under the queue lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStats {
    pub job_id: JobId,
    pub queued: usize,
    pub running: usize,
    /// Done operations currently retained (see `QueueConfig::keep_done_ops`).
    pub done: usize,
    pub error: usize,
    /// Successful completions since the queue was created, purged ones included.
    pub done_total: u64,
    /// Done operations that left the queue through a purge or were never retained.
    pub removed: u64,
    pub total_added: u64,
    pub queued_cost: PerStorageCost,
    pub running_cost: PerStorageCost,
    /// Measured cost of every completion, success and error alike.
    pub done_cost: PerStorageCost,
    pub error_cost: PerStorageCost,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task {task_id} is already known to job {job_id}")]
    DuplicateTask { job_id: JobId, task_id: TaskId },
    #[error("operation of job {actual} offered to the queue of job {expected}")]
    WrongJob { expected: JobId, actual: JobId },
    #[error("task {task_id} of job {job_id} is not running")]
    NotRunning { job_id: JobId, task_id: TaskId },
}
