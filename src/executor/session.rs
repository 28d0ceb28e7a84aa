//! Executor Session Registry
//!
//! Tracks the remote executor processes polling this server for work.
//!
//! ## Responsibilities
//! - **Session lifecycle**: `start` (duplicate ids rejected), `stop`, and forced
//!   expiry of sessions whose last call is older than the liveness timeout.
//! - **Ownership**: every operation handed to a session is recorded as a
//!   `PolledTask`; only the owning session may report its result.
//! - **Failover**: when a session ends for any reason, its owned tasks go back to
//!   the front of their job queues in the order they were polled.
//! - **Control**: operators set per-session flags returned with every response.
//!
//! The session table lock is never held while job queues are touched.

use super::registry::JobRegistry;
use crate::config::SessionConfig;
use crate::ops::{ExecutionResult, JobId, Operation, TaskId, now_ms};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new random UUID v4-based session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-side steering flags, piggybacked on every response to an executor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlFlags {
    /// Stop pulling new work, keep finishing what is in flight.
    pub polling_suspend_requested: bool,
    /// Finish in-flight work, report it, then end the session.
    pub stop_requested: bool,
    /// Stop immediately; the server will notice through the liveness timeout.
    pub kill_requested: bool,
}

impl ControlFlags {
    pub fn blocks_polling(&self) -> bool {
        self.polling_suspend_requested || self.stop_requested || self.kill_requested
    }
}

/// An operation handed to a session and not yet reported back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolledTask {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub polled_time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub host: String,
    pub start_time: u64,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub info: SessionInfo,
    pub last_ping_alive_time: u64,
    pub owned_tasks: usize,
    pub control: ControlFlags,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("executor session {0} already started")]
    DuplicateSession(SessionId),
    #[error("unknown executor session {0}")]
    UnknownSession(SessionId),
}

struct ExecutorSession {
    info: SessionInfo,
    last_ping_alive: Instant,
    last_ping_alive_time: u64,
    /// In poll order.
    polled: Vec<PolledTask>,
    control: ControlFlags,
}

impl ExecutorSession {
    fn touch(&mut self) {
        self.last_ping_alive = Instant::now();
        self.last_ping_alive_time = now_ms();
    }

    fn take_owned(&mut self, job_id: &JobId, task_id: TaskId) -> bool {
        match self
            .polled
            .iter()
            .position(|t| t.task_id == task_id && &t.job_id == job_id)
        {
            Some(idx) => {
                self.polled.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// Response to a poll: newly owned operations plus the current control flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollOutcome {
    pub ops: Vec<Operation>,
    pub control: ControlFlags,
}

pub struct ExecutorSessionRegistry {
    sessions: Mutex<HashMap<SessionId, ExecutorSession>>,
    jobs: Arc<JobRegistry>,
    config: SessionConfig,
}

impl ExecutorSessionRegistry {
    pub fn new(jobs: Arc<JobRegistry>, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            jobs,
            config,
        })
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    pub fn start(&self, info: SessionInfo) -> Result<ControlFlags, SessionError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&info.session_id) {
            tracing::warn!("Rejected duplicate start of executor session {}", info.session_id);
            return Err(SessionError::DuplicateSession(info.session_id));
        }
        tracing::info!(
            "Executor session {} started on {} (props: {:?})",
            info.session_id,
            info.host,
            info.props
        );
        sessions.insert(
            info.session_id.clone(),
            ExecutorSession {
                info,
                last_ping_alive: Instant::now(),
                last_ping_alive_time: now_ms(),
                polled: Vec::new(),
                control: ControlFlags::default(),
            },
        );
        Ok(ControlFlags::default())
    }

    /// Ends a session and re-queues everything it still owns. Returns the number
    /// of re-queued operations.
    pub fn stop(&self, session_id: &SessionId, reason: &str) -> Result<usize, SessionError> {
        let session = self
            .sessions
            .lock()
            .remove(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
        tracing::info!(
            "Executor session {} stopped ({}), {} owned operations",
            session_id,
            reason,
            session.polled.len()
        );
        Ok(self.requeue_owned(session.polled))
    }

    pub fn ping_alive(&self, session_id: &SessionId) -> Result<ControlFlags, SessionError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
        session.touch();
        Ok(session.control)
    }

    /// Accepts completed results from a session and hands it up to `poll_count`
    /// new operations. Results for tasks the session does not own are dropped.
    pub fn poll_next(
        &self,
        session_id: &SessionId,
        results: Vec<ExecutionResult>,
        poll_count: usize,
    ) -> Result<PollOutcome, SessionError> {
        let (accepted, control) = {
            let mut sessions = self.sessions.lock();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
            session.touch();
            let mut accepted = Vec::with_capacity(results.len());
            for result in results {
                if session.take_owned(&result.job_id, result.task_id) {
                    accepted.push(result);
                } else {
                    tracing::warn!(
                        "Session {} reported task {}:{} it does not own, ignoring",
                        session_id,
                        result.job_id,
                        result.task_id
                    );
                }
            }
            (accepted, session.control)
        };

        for result in accepted {
            let (job_id, task_id) = (result.job_id.clone(), result.task_id);
            if let Err(e) = self.jobs.route_result(result) {
                tracing::warn!("Could not record result of {}:{}: {}", job_id, task_id, e);
            }
        }

        let poll_count = if control.blocks_polling() { 0 } else { poll_count };
        let ops = self.jobs.poll_ops(poll_count);
        if ops.is_empty() {
            return Ok(PollOutcome { ops: Vec::new(), control });
        }

        let polled_time = now_ms();
        let owned: Vec<PolledTask> = ops
            .iter()
            .map(|op| PolledTask {
                job_id: op.job_id.clone(),
                task_id: op.task_id,
                polled_time,
            })
            .collect();
        let registered = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(session_id) {
                Some(session) => {
                    session.polled.extend(owned.iter().cloned());
                    Some(session.control)
                }
                None => None,
            }
        };
        match registered {
            Some(control) => {
                tracing::debug!("Session {} polled {} operations", session_id, ops.len());
                Ok(PollOutcome {
                    ops: ops.iter().map(|op| op.as_ref().clone()).collect(),
                    control,
                })
            }
            None => {
                // The session ended while we were polling.
                self.requeue_owned(owned);
                Err(SessionError::UnknownSession(session_id.clone()))
            }
        }
    }

    pub fn set_control(&self, session_id: &SessionId, control: ControlFlags) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.clone()))?;
        if session.control != control {
            tracing::info!("Executor session {} control set to {:?}", session_id, control);
        }
        session.control = control;
        Ok(())
    }

    /// Expires every session silent for longer than the liveness timeout as of `now`.
    pub fn expire_dead_sessions_at(&self, now: Instant) -> Vec<SessionId> {
        let expired: Vec<(SessionId, Vec<PolledTask>)> = {
            let mut sessions = self.sessions.lock();
            let dead: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, s)| now.saturating_duration_since(s.last_ping_alive) > self.config.liveness_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            dead.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|s| (id, s.polled)))
                .collect()
        };

        let mut ids = Vec::with_capacity(expired.len());
        for (session_id, polled) in expired {
            tracing::warn!(
                "Executor session {} missed its ping-alive deadline, expiring ({} owned operations)",
                session_id,
                polled.len()
            );
            self.requeue_owned(polled);
            ids.push(session_id);
        }
        ids
    }

    pub fn expire_dead_sessions(&self) -> Vec<SessionId> {
        self.expire_dead_sessions_at(Instant::now())
    }

    /// Periodic liveness check, every `check_interval` until `cancel` fires.
    pub fn spawn_liveness_check(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.check_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let expired = self.expire_dead_sessions();
                        if !expired.is_empty() {
                            tracing::info!("Liveness check expired {} sessions", expired.len());
                        }
                    }
                }
            }
            tracing::debug!("Liveness check stopped");
        })
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock();
        let mut result: Vec<SessionSummary> = sessions
            .values()
            .map(|s| SessionSummary {
                info: s.info.clone(),
                last_ping_alive_time: s.last_ping_alive_time,
                owned_tasks: s.polled.len(),
                control: s.control,
            })
            .collect();
        result.sort_by(|a, b| a.info.session_id.cmp(&b.info.session_id));
        result
    }

    pub fn owned_tasks(&self, session_id: &SessionId) -> Option<Vec<PolledTask>> {
        self.sessions.lock().get(session_id).map(|s| s.polled.clone())
    }

    /// Groups tasks by job, keeping poll order, and puts them back at the front.
    fn requeue_owned(&self, polled: Vec<PolledTask>) -> usize {
        let mut by_job: Vec<(JobId, Vec<TaskId>)> = Vec::new();
        for task in polled {
            match by_job.iter_mut().find(|(job_id, _)| *job_id == task.job_id) {
                Some((_, task_ids)) => task_ids.push(task.task_id),
                None => by_job.push((task.job_id, vec![task.task_id])),
            }
        }
        let mut requeued = 0;
        for (job_id, task_ids) in by_job {
            match self.jobs.requeue_front(&job_id, &task_ids) {
                Ok(count) => requeued += count,
                Err(e) => tracing::warn!("Could not re-queue {} tasks of job {}: {}", task_ids.len(), job_id, e),
            }
        }
        requeued
    }
}
