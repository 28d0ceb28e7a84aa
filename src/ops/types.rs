use crate::iocost::PerStorageCost;
use crate::storage::StorageId;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a job: a named collection of operations sharing one queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-assigned task number, unique within its job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One source file packed into a zip-copy destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZipEntry {
    pub dest_entry_path: String,
    pub src_path: String,
    pub src_len: u64,
}

/// Variant payloads. Only storage ids and paths are carried, never credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OpKind {
    Mkdir {
        storage: StorageId,
        path: String,
    },
    /// Whole-file copy: checks the source metadata and creates the destination parent.
    CopyFile {
        dest_storage: StorageId,
        dest_path: String,
        src_storage: StorageId,
        src_path: String,
        src_len: u64,
    },
    /// Raw content copy of `src_len` bytes, no metadata calls.
    CopyFileContent {
        dest_storage: StorageId,
        dest_path: String,
        src_storage: StorageId,
        src_path: String,
        src_len: u64,
    },
    /// Packs several source files into one destination archive.
    ZipCopyFile {
        dest_storage: StorageId,
        dest_path: String,
        src_storage: StorageId,
        entries: Vec<ZipEntry>,
    },
    /// Sleeps; used for load and protocol tests.
    MockSleep {
        millis: u64,
    },
}

/// A single immutable unit of storage-mutating work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(job_id: JobId, task_id: TaskId, kind: OpKind) -> Self {
        Self {
            job_id,
            task_id,
            kind,
        }
    }

    /// Short variant name for logs.
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            OpKind::Mkdir { .. } => "mkdir",
            OpKind::CopyFile { .. } => "copy",
            OpKind::CopyFileContent { .. } => "copy_content",
            OpKind::ZipCopyFile { .. } => "zip_copy",
            OpKind::MockSleep { .. } => "mock_sleep",
        }
    }
}

/// Outcome of one execution attempt.
///
/// `error_message` set means failure; non-empty `warnings` without an error means
/// partial success. `exception` carries the description of a fault that escaped
/// the operation body (panic, rejected worker).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub task_id: TaskId,
    /// Milliseconds since the epoch.
    pub start_time: u64,
    pub elapsed_millis: u64,
    pub warnings: Vec<String>,
    pub error_message: Option<String>,
    pub exception: Option<String>,
    pub measured_cost: PerStorageCost,
}

impl ExecutionResult {
    pub fn success(op: &Operation, start_time: u64, elapsed_millis: u64, measured_cost: PerStorageCost) -> Self {
        Self {
            job_id: op.job_id.clone(),
            task_id: op.task_id,
            start_time,
            elapsed_millis,
            warnings: Vec::new(),
            error_message: None,
            exception: None,
            measured_cost,
        }
    }

    pub fn failure(op: &Operation, start_time: u64, error_message: impl Into<String>) -> Self {
        Self {
            job_id: op.job_id.clone(),
            task_id: op.task_id,
            start_time,
            elapsed_millis: 0,
            warnings: Vec::new(),
            error_message: Some(error_message.into()),
            exception: None,
            measured_cost: PerStorageCost::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
