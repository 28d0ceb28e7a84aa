//! Network Protocol Definitions
//!
//! DTOs for the executor polling RPC and the job administration endpoints.
//! Operation lists are submitted to `/job/:id/ops` in the text encoding of
//! `ops::codec`; everything else is JSON.

use super::registry::JobStats;
use super::session::{ControlFlags, SessionId, SessionInfo, SessionSummary};
use crate::iocost::StorageThroughput;
use crate::ops::{ExecutionResult, Operation};

use serde::{Deserialize, Serialize};

pub const ENDPOINT_EXECUTOR_START: &str = "/executor/start";
pub const ENDPOINT_EXECUTOR_STOP: &str = "/executor/stop";
pub const ENDPOINT_EXECUTOR_PING: &str = "/executor/ping";
pub const ENDPOINT_EXECUTOR_POLL: &str = "/executor/poll";
pub const ENDPOINT_EXECUTOR_CONTROL: &str = "/executor/:id/control";
pub const ENDPOINT_EXECUTOR_SESSIONS: &str = "/executor/sessions";
pub const ENDPOINT_JOB_OPS: &str = "/job/:id/ops";
pub const ENDPOINT_JOB_STATS: &str = "/job/:id/stats";
pub const ENDPOINT_JOB_POLLING: &str = "/job/:id/polling";
pub const ENDPOINT_JOB_RETRY_ERRORS: &str = "/job/:id/retry_errors";
pub const ENDPOINT_JOB_PURGE_DONE: &str = "/job/:id/purge_done";
pub const ENDPOINT_IO_THROUGHPUT: &str = "/io/throughput";

pub type StartSessionRequest = SessionInfo;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopSessionRequest {
    pub session_id: SessionId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopSessionResponse {
    pub requeued: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingAliveRequest {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub control: ControlFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    pub session_id: SessionId,
    pub results: Vec<ExecutionResult>,
    pub poll_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub ops: Vec<Operation>,
    pub control: ControlFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddOpsResponse {
    pub added: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetPollingRequest {
    pub active: bool,
}

pub type JobStatsResponse = JobStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryErrorsResponse {
    pub retried: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeDoneResponse {
    pub results: Vec<ExecutionResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputResponse {
    pub storages: Vec<StorageThroughput>,
}
