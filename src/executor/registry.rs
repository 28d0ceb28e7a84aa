//! Job Registry
//!
//! Server-side table of jobs. Each job owns one queue (optionally persisted) and
//! a polling switch that operators flip to pause or resume distribution of its
//! operations. The registry is explicit server state, shared by handle with the
//! session registry and the HTTP handlers.

use super::persisted::{PersistedQueue, join_path};
use super::queue::ExecutionQueue;
use super::types::{DoneOp, QueueError, QueueStats};
use crate::config::{PersistConfig, QueueConfig};
use crate::iocost::StorageIoTracker;
use crate::ops::{ExecutionResult, JobId, Operation, TaskId, now_ms};
use crate::storage::{StorageBackend, StorageError};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job {0} already exists")]
    DuplicateJob(JobId),
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("invalid job id {0:?}: {1}")]
    InvalidJobId(String, &'static str),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("persistence failure: {0:#}")]
    Persistence(anyhow::Error),
}

/// Job ids name directories under the persistence base dir, so they must be a
/// single plain path segment.
fn validate_job_id(job_id: &JobId) -> Result<(), RegistryError> {
    let id = job_id.0.as_str();
    let reason = if id.is_empty() {
        "empty"
    } else if id == "." || id == ".." {
        "reserved path segment"
    } else if id.contains(['/', '\\', '\0']) {
        "contains a path separator"
    } else {
        return Ok(());
    };
    Err(RegistryError::InvalidJobId(id.to_string(), reason))
}

struct PollingClock {
    active: bool,
    since: Instant,
    active_total: Duration,
    suspended_total: Duration,
}

impl PollingClock {
    fn totals(&self) -> (Duration, Duration) {
        let current = self.since.elapsed();
        if self.active {
            (self.active_total + current, self.suspended_total)
        } else {
            (self.active_total, self.suspended_total + current)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStats {
    pub queue: QueueStats,
    pub polling_active: bool,
    pub active_millis: u64,
    pub suspended_millis: u64,
    pub created_at: u64,
}

/// One job: its queue plus the polling switch and its accumulated durations.
pub struct JobQueueEntry {
    queue: Arc<ExecutionQueue>,
    persisted: Option<Arc<PersistedQueue>>,
    polling: Mutex<PollingClock>,
    created_at: u64,
}

impl JobQueueEntry {
    fn new(queue: Arc<ExecutionQueue>, persisted: Option<Arc<PersistedQueue>>) -> Self {
        Self {
            queue,
            persisted,
            polling: Mutex::new(PollingClock {
                active: true,
                since: Instant::now(),
                active_total: Duration::ZERO,
                suspended_total: Duration::ZERO,
            }),
            created_at: now_ms(),
        }
    }

    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }

    pub fn persisted(&self) -> Option<&Arc<PersistedQueue>> {
        self.persisted.as_ref()
    }

    pub fn add_ops(&self, ops: Vec<Operation>) -> Result<(), RegistryError> {
        match &self.persisted {
            Some(persisted) => persisted.add_ops(ops).map_err(|e| match e.downcast::<QueueError>() {
                Ok(queue_error) => RegistryError::Queue(queue_error),
                Err(other) => RegistryError::Persistence(other),
            }),
            None => Ok(self.queue.add_ops(ops)?),
        }
    }

    pub fn is_polling_active(&self) -> bool {
        self.polling.lock().active
    }

    /// Switches polling on or off, closing the current active/suspended period.
    pub fn set_polling_active(&self, active: bool) {
        let mut clock = self.polling.lock();
        if clock.active == active {
            return;
        }
        let elapsed = clock.since.elapsed();
        if clock.active {
            clock.active_total += elapsed;
        } else {
            clock.suspended_total += elapsed;
        }
        clock.active = active;
        clock.since = Instant::now();
        tracing::info!(
            "Job {}: polling {}",
            self.queue.job_id(),
            if active { "resumed" } else { "suspended" }
        );
    }

    pub fn to_stats(&self) -> JobStats {
        let (active, suspended, polling_active) = {
            let clock = self.polling.lock();
            let (active, suspended) = clock.totals();
            (active, suspended, clock.active)
        };
        JobStats {
            queue: self.queue.stats(),
            polling_active,
            active_millis: active.as_millis() as u64,
            suspended_millis: suspended.as_millis() as u64,
            created_at: self.created_at,
        }
    }
}

struct Persistence {
    storage: Arc<dyn StorageBackend>,
    base_dir: String,
    config: PersistConfig,
}

pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<JobQueueEntry>>,
    queue_config: QueueConfig,
    persistence: Option<Persistence>,
    tracker: Arc<StorageIoTracker>,
}

impl JobRegistry {
    /// In-memory jobs only.
    pub fn new(queue_config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            jobs: DashMap::new(),
            queue_config,
            persistence: None,
            tracker: StorageIoTracker::new(),
        })
    }

    /// Every job gets a persisted queue under `<base_dir>/<job id>` on `storage`.
    pub fn with_persistence(
        queue_config: QueueConfig,
        storage: Arc<dyn StorageBackend>,
        base_dir: &str,
        config: PersistConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs: DashMap::new(),
            queue_config,
            persistence: Some(Persistence {
                storage,
                base_dir: base_dir.to_string(),
                config,
            }),
            tracker: StorageIoTracker::new(),
        })
    }

    pub fn tracker(&self) -> &Arc<StorageIoTracker> {
        &self.tracker
    }

    pub fn create_job(&self, job_id: JobId) -> Result<Arc<JobQueueEntry>, RegistryError> {
        validate_job_id(&job_id)?;
        if self.jobs.contains_key(&job_id) {
            return Err(RegistryError::DuplicateJob(job_id));
        }
        let entry = match &self.persistence {
            Some(p) => {
                let persisted = PersistedQueue::open(
                    job_id.clone(),
                    p.storage.clone(),
                    &join_path(&p.base_dir, &job_id.0),
                    self.queue_config.clone(),
                    p.config.clone(),
                )
                .map_err(RegistryError::Persistence)?;
                JobQueueEntry::new(persisted.queue().clone(), Some(persisted))
            }
            None => JobQueueEntry::new(
                ExecutionQueue::new(job_id.clone(), self.queue_config.clone()),
                None,
            ),
        };
        let entry = Arc::new(entry);
        match self.jobs.entry(job_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RegistryError::DuplicateJob(job_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                tracing::info!("Created job {}", job_id);
                Ok(entry)
            }
        }
    }

    /// Re-opens every job directory found under the persistence base dir.
    /// A no-op for in-memory registries.
    pub fn recover_jobs(&self) -> Result<Vec<JobId>, RegistryError> {
        let Some(p) = &self.persistence else {
            return Ok(Vec::new());
        };
        let persistence_error = |e: StorageError| RegistryError::Persistence(anyhow::Error::new(e));
        if !p.storage.exists(&p.base_dir).map_err(persistence_error)? {
            return Ok(Vec::new());
        }
        let mut recovered = Vec::new();
        for child in p.storage.list(&p.base_dir).map_err(persistence_error)? {
            if !child.is_dir {
                continue;
            }
            let name = child.path.rsplit('/').next().unwrap_or_default();
            let remaining = join_path(&child.path, &p.config.remaining_ops_file);
            if name.is_empty() || !p.storage.exists(&remaining).map_err(persistence_error)? {
                continue;
            }
            let job_id = JobId::new(name);
            match self.create_job(job_id.clone()) {
                Ok(_) => recovered.push(job_id),
                Err(RegistryError::DuplicateJob(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if !recovered.is_empty() {
            tracing::info!("Recovered {} persisted jobs from {}", recovered.len(), p.base_dir);
        }
        Ok(recovered)
    }

    /// Returns the job, creating it if it does not exist yet.
    pub fn get_or_create(&self, job_id: &JobId) -> Result<Arc<JobQueueEntry>, RegistryError> {
        if let Some(entry) = self.get(job_id) {
            return Ok(entry);
        }
        match self.create_job(job_id.clone()) {
            Err(RegistryError::DuplicateJob(_)) => self.job(job_id),
            other => other,
        }
    }

    pub fn get(&self, job_id: &JobId) -> Option<Arc<JobQueueEntry>> {
        self.jobs.get(job_id).map(|entry| entry.value().clone())
    }

    pub fn job(&self, job_id: &JobId) -> Result<Arc<JobQueueEntry>, RegistryError> {
        self.get(job_id)
            .ok_or_else(|| RegistryError::UnknownJob(job_id.clone()))
    }

    /// Removes a job; a persisted job is flushed and checkpointed first.
    pub fn remove_job(&self, job_id: &JobId) -> Result<Arc<JobQueueEntry>, RegistryError> {
        let (_, entry) = self
            .jobs
            .remove(job_id)
            .ok_or_else(|| RegistryError::UnknownJob(job_id.clone()))?;
        if let Some(persisted) = &entry.persisted {
            persisted.close().map_err(RegistryError::Persistence)?;
        }
        tracing::info!("Removed job {}", job_id);
        Ok(entry)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.jobs.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Polls up to `max_ops` operations across jobs with polling active, in job id order.
    pub fn poll_ops(&self, max_ops: usize) -> Vec<Arc<Operation>> {
        let mut ops = Vec::new();
        for job_id in self.job_ids() {
            if ops.len() >= max_ops {
                break;
            }
            let Some(entry) = self.get(&job_id) else {
                continue;
            };
            if !entry.is_polling_active() {
                continue;
            }
            ops.extend(entry.queue.poll_batch(max_ops - ops.len(), u64::MAX));
        }
        ops
    }

    /// Puts running tasks of one job back at the front of its queue, in the given order.
    pub fn requeue_front(&self, job_id: &JobId, task_ids: &[TaskId]) -> Result<usize, RegistryError> {
        Ok(self.job(job_id)?.queue.requeue_front(task_ids)?)
    }

    /// Routes a result reported by a remote executor to its job's queue.
    pub fn route_result(&self, result: ExecutionResult) -> Result<(), RegistryError> {
        let entry = self.job(&result.job_id)?;
        self.tracker.record(&result.measured_cost);
        match result.exception.clone() {
            Some(exception) => entry.queue.on_op_unexpected_error(result.task_id, &exception)?,
            None => entry.queue.on_op_executed(result)?,
        }
        Ok(())
    }

    pub fn stats(&self) -> Vec<JobStats> {
        self.job_ids()
            .iter()
            .filter_map(|job_id| self.get(job_id))
            .map(|entry| entry.to_stats())
            .collect()
    }

    pub fn purge_done_ops(&self, job_id: &JobId) -> Result<Vec<DoneOp>, RegistryError> {
        Ok(self.job(job_id)?.queue.purge_done_ops())
    }

    /// Flushes and checkpoints every persisted job.
    pub fn flush_all(&self) {
        for entry in self.jobs.iter() {
            if let Some(persisted) = &entry.value().persisted {
                if let Err(e) = persisted.flush().and_then(|_| persisted.checkpoint().map(|_| ())) {
                    tracing::error!("Failed to persist job {}: {:#}", entry.key(), e);
                }
            }
        }
    }
}
