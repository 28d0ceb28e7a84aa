//! Execution Queue
//!
//! In-memory state machine for the operations of one job:
//! `Queued -> Running -> {Done, Error}`, with `Running -> Queued` on re-queue.
//!
//! ## Responsibilities
//! - **Ordering**: FIFO for fresh work, re-queued work jumps to the front.
//! - **Cost accounting**: `queued_cost`/`running_cost` always equal the sum of the
//!   pre-estimates of their members; `done_cost`/`error_cost` accumulate measured cost.
//! - **Batch admission**: `poll_batch` drains a count- and byte-bounded batch atomically.
//! - **Observation**: lifecycle events go to registered `QueueObserver`s, always
//!   outside the queue lock.
//!
//! All state sits behind one mutex; every transition is a handful of map and
//! deque operations, so a single coarse lock is enough.

use super::types::{DoneOp, ErrorOp, OpState, QueueError, QueueStats};
use crate::config::QueueConfig;
use crate::iocost::PerStorageCost;
use crate::ops::{ExecutionResult, JobId, Operation, TaskId};

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Lifecycle hooks. Every method has a no-op default so observers implement
/// only what they care about.
pub trait QueueObserver: Send + Sync {
    fn on_add_ops(&self, _ops: &[Arc<Operation>]) {}

    fn on_op_executed_success(&self, _op: &Operation, _result: &ExecutionResult) {}

    fn on_op_executed_error(&self, _op: &Operation, _result: &ExecutionResult) {}

    fn on_op_unexpected_error(&self, _op: &Operation, _error: &str) {}

    fn on_op_requeue(&self, _op: &Operation) {}
}

/// An operation together with its pre-estimate, computed once on enqueue.
#[derive(Clone)]
struct PendingOp {
    op: Arc<Operation>,
    estimate: PerStorageCost,
}

impl PendingOp {
    fn new(op: Arc<Operation>) -> Self {
        let estimate = op.pre_estimate_cost();
        Self { op, estimate }
    }
}

#[derive(Default)]
struct QueueState {
    queued: VecDeque<PendingOp>,
    running: HashMap<TaskId, PendingOp>,
    done: Vec<DoneOp>,
    errors: BTreeMap<TaskId, ErrorOp>,
    states: HashMap<TaskId, OpState>,
    queued_cost: PerStorageCost,
    running_cost: PerStorageCost,
    done_cost: PerStorageCost,
    error_cost: PerStorageCost,
    done_total: u64,
    removed: u64,
    total_added: u64,
}

/// Lifecycle events collected under the lock and delivered after it is released.
enum Event {
    Added(Vec<Arc<Operation>>),
    Success(Arc<Operation>, ExecutionResult),
    Failure(Arc<Operation>, ExecutionResult),
    Unexpected(Arc<Operation>, String),
    Requeued(Arc<Operation>),
}

pub struct ExecutionQueue {
    job_id: JobId,
    config: QueueConfig,
    state: Mutex<QueueState>,
    observers: RwLock<Vec<Arc<dyn QueueObserver>>>,
}

impl ExecutionQueue {
    pub fn new(job_id: JobId, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            job_id,
            config,
            state: Mutex::new(QueueState::default()),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn add_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.observers.write().push(observer);
    }

    fn notify(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let observers = self.observers.read().clone();
        for observer in &observers {
            for event in &events {
                match event {
                    Event::Added(ops) => observer.on_add_ops(ops),
                    Event::Success(op, result) => observer.on_op_executed_success(op, result),
                    Event::Failure(op, result) => observer.on_op_executed_error(op, result),
                    Event::Unexpected(op, error) => observer.on_op_unexpected_error(op, error),
                    Event::Requeued(op) => observer.on_op_requeue(op),
                }
            }
        }
    }

    /// Cost decrements can only fail on a bookkeeping defect.
    fn decr_or_report(&self, aggregate: &mut PerStorageCost, amount: &PerStorageCost, name: &str) {
        if let Err(e) = aggregate.decr(amount) {
            tracing::error!("Job {}: {} accounting defect: {}", self.job_id, name, e);
            debug_assert!(false, "{} accounting defect: {}", name, e);
        }
    }

    // --- Enqueue ---

    pub fn add_op(&self, op: Operation) -> Result<(), QueueError> {
        self.add_ops(vec![op])
    }

    /// Appends all operations to the tail, or none of them if any id is a duplicate.
    pub fn add_ops(&self, ops: Vec<Operation>) -> Result<(), QueueError> {
        if ops.is_empty() {
            return Ok(());
        }
        let pending: Vec<PendingOp> = ops.into_iter().map(|op| PendingOp::new(Arc::new(op))).collect();
        {
            let mut state = self.state.lock();
            self.check_new_ops(&state, pending.iter().map(|p| &*p.op))?;
            for p in &pending {
                state.queued_cost.incr(&p.estimate);
                state.states.insert(p.op.task_id, OpState::Queued);
            }
            state.total_added += pending.len() as u64;
            state.queued.extend(pending.iter().cloned());
        }
        tracing::debug!("Job {}: queued {} operations", self.job_id, pending.len());
        self.notify(vec![Event::Added(pending.into_iter().map(|p| p.op).collect())]);
        Ok(())
    }

    /// Checks that `add_ops` would accept `ops`, without enqueueing anything.
    pub fn validate_new_ops(&self, ops: &[Operation]) -> Result<(), QueueError> {
        let state = self.state.lock();
        self.check_new_ops(&state, ops.iter())
    }

    fn check_new_ops<'a>(
        &self,
        state: &QueueState,
        ops: impl Iterator<Item = &'a Operation>,
    ) -> Result<(), QueueError> {
        let mut seen = HashSet::new();
        for op in ops {
            if op.job_id != self.job_id {
                return Err(QueueError::WrongJob {
                    expected: self.job_id.clone(),
                    actual: op.job_id.clone(),
                });
            }
            if state.states.contains_key(&op.task_id) || !seen.insert(op.task_id) {
                return Err(QueueError::DuplicateTask {
                    job_id: self.job_id.clone(),
                    task_id: op.task_id,
                });
            }
        }
        Ok(())
    }

    // --- Poll ---

    /// Pops the head of the queue; `None` means no work right now.
    pub fn poll(&self) -> Option<Arc<Operation>> {
        self.poll_batch(1, u64::MAX).pop()
    }

    /// Moves up to `max_ops` operations from the head of the queue to `running`.
    ///
    /// An operation whose pre-estimated bytes would push the batch past
    /// `max_bytes` ends the batch, except the first one, which is always taken.
    pub fn poll_batch(&self, max_ops: usize, max_bytes: u64) -> Vec<Arc<Operation>> {
        let mut state = self.state.lock();
        let mut batch = Vec::new();
        let mut batch_bytes = 0u64;
        while batch.len() < max_ops {
            let Some(head) = state.queued.front() else {
                break;
            };
            let op_bytes = head.estimate.total().io_len();
            if !batch.is_empty() && batch_bytes.saturating_add(op_bytes) > max_bytes {
                break;
            }
            let Some(pending) = state.queued.pop_front() else {
                break;
            };
            batch_bytes = batch_bytes.saturating_add(op_bytes);
            let QueueState { queued_cost, running_cost, .. } = &mut *state;
            self.decr_or_report(queued_cost, &pending.estimate, "queued cost");
            running_cost.incr(&pending.estimate);
            state.states.insert(pending.op.task_id, OpState::Running);
            batch.push(pending.op.clone());
            state.running.insert(pending.op.task_id, pending);
        }
        if !batch.is_empty() {
            tracing::trace!(
                "Job {}: polled {} operations ({} estimated bytes)",
                self.job_id,
                batch.len(),
                batch_bytes
            );
        }
        batch
    }

    // --- Completion ---

    fn take_running(&self, state: &mut QueueState, task_id: TaskId) -> Result<PendingOp, QueueError> {
        let pending = state.running.remove(&task_id).ok_or_else(|| QueueError::NotRunning {
            job_id: self.job_id.clone(),
            task_id,
        })?;
        self.decr_or_report(&mut state.running_cost, &pending.estimate, "running cost");
        Ok(pending)
    }

    /// Routes a result to `done` or `error` depending on `error_message`.
    pub fn on_op_executed(&self, result: ExecutionResult) -> Result<(), QueueError> {
        let event = {
            let mut state = self.state.lock();
            let pending = self.take_running(&mut state, result.task_id)?;
            state.done_cost.incr(&result.measured_cost);
            match &result.error_message {
                None => {
                    state.done_total += 1;
                    if self.config.keep_done_ops {
                        state.states.insert(result.task_id, OpState::Done);
                        state.done.push(DoneOp {
                            op: pending.op.clone(),
                            result: result.clone(),
                        });
                    } else {
                        state.states.remove(&result.task_id);
                        state.removed += 1;
                    }
                    Event::Success(pending.op, result)
                }
                Some(message) => {
                    state.error_cost.incr(&result.measured_cost);
                    state.states.insert(result.task_id, OpState::Error);
                    state.errors.insert(
                        result.task_id,
                        ErrorOp {
                            op: pending.op.clone(),
                            error_message: message.clone(),
                            result: Some(result.clone()),
                        },
                    );
                    Event::Failure(pending.op, result)
                }
            }
        };
        self.notify(vec![event]);
        Ok(())
    }

    /// A fault escaped execution: the task goes to `error` with no cost data.
    pub fn on_op_unexpected_error(&self, task_id: TaskId, error: &str) -> Result<(), QueueError> {
        let op = {
            let mut state = self.state.lock();
            let pending = self.take_running(&mut state, task_id)?;
            state.states.insert(task_id, OpState::Error);
            state.errors.insert(
                task_id,
                ErrorOp {
                    op: pending.op.clone(),
                    error_message: error.to_string(),
                    result: None,
                },
            );
            pending.op
        };
        tracing::error!("Job {}: task {} failed unexpectedly: {}", self.job_id, task_id, error);
        self.notify(vec![Event::Unexpected(op, error.to_string())]);
        Ok(())
    }

    // --- Re-queue ---

    /// Moves a running task back to the front of the queue.
    pub fn on_op_requeue(&self, task_id: TaskId) -> Result<(), QueueError> {
        self.requeue_front(&[task_id]).map(|_| ())
    }

    /// Moves running tasks back to the front of the queue, keeping their given
    /// order ahead of everything already queued. Ids that are not running are
    /// skipped; returns how many were re-queued.
    pub fn requeue_front(&self, task_ids: &[TaskId]) -> Result<usize, QueueError> {
        let requeued = {
            let mut state = self.state.lock();
            let mut requeued = Vec::with_capacity(task_ids.len());
            for task_id in task_ids.iter().rev() {
                let Ok(pending) = self.take_running(&mut state, *task_id) else {
                    continue;
                };
                state.queued_cost.incr(&pending.estimate);
                state.states.insert(*task_id, OpState::Queued);
                requeued.push(pending.op.clone());
                state.queued.push_front(pending);
            }
            requeued.reverse();
            requeued
        };
        if requeued.is_empty() && !task_ids.is_empty() {
            return Err(QueueError::NotRunning {
                job_id: self.job_id.clone(),
                task_id: task_ids[0],
            });
        }
        tracing::debug!("Job {}: re-queued {} operations at the front", self.job_id, requeued.len());
        let count = requeued.len();
        self.notify(requeued.into_iter().map(Event::Requeued).collect());
        Ok(count)
    }

    /// Moves every errored task back to the tail of the queue for another attempt.
    pub fn retry_error_ops(&self) -> usize {
        let mut state = self.state.lock();
        let errors = std::mem::take(&mut state.errors);
        let count = errors.len();
        for (task_id, error_op) in errors {
            if let Some(result) = &error_op.result {
                let QueueState { error_cost, .. } = &mut *state;
                self.decr_or_report(error_cost, &result.measured_cost, "error cost");
            }
            let pending = PendingOp::new(error_op.op);
            state.queued_cost.incr(&pending.estimate);
            state.states.insert(task_id, OpState::Queued);
            state.queued.push_back(pending);
        }
        if count > 0 {
            tracing::info!("Job {}: retrying {} errored operations", self.job_id, count);
        }
        count
    }

    /// Drains the retained done set for archival.
    pub fn purge_done_ops(&self) -> Vec<DoneOp> {
        let mut state = self.state.lock();
        let done = std::mem::take(&mut state.done);
        for done_op in &done {
            state.states.remove(&done_op.op.task_id);
        }
        state.removed += done.len() as u64;
        done
    }

    // --- Inspection ---

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            job_id: self.job_id.clone(),
            queued: state.queued.len(),
            running: state.running.len(),
            done: state.done.len(),
            error: state.errors.len(),
            done_total: state.done_total,
            removed: state.removed,
            total_added: state.total_added,
            queued_cost: state.queued_cost.clone(),
            running_cost: state.running_cost.clone(),
            done_cost: state.done_cost.clone(),
            error_cost: state.error_cost.clone(),
        }
    }

    pub fn op_state(&self, task_id: TaskId) -> Option<OpState> {
        self.state.lock().states.get(&task_id).copied()
    }

    pub fn queued_ops(&self) -> Vec<Arc<Operation>> {
        self.state.lock().queued.iter().map(|p| p.op.clone()).collect()
    }

    pub fn running_ops(&self) -> Vec<Arc<Operation>> {
        let state = self.state.lock();
        let mut ops: Vec<_> = state.running.values().map(|p| p.op.clone()).collect();
        ops.sort_by_key(|op| op.task_id);
        ops
    }

    /// `(op, error_message)` for every member of the error set, by task id.
    pub fn error_ops(&self) -> Vec<(Arc<Operation>, String)> {
        self.state
            .lock()
            .errors
            .values()
            .map(|e| (e.op.clone(), e.error_message.clone()))
            .collect()
    }

    /// Operations that have not completed successfully: queued, then running, then errored.
    pub fn remaining_ops(&self) -> Vec<Arc<Operation>> {
        let state = self.state.lock();
        let mut running: Vec<_> = state.running.values().map(|p| p.op.clone()).collect();
        running.sort_by_key(|op| op.task_id);
        state
            .queued
            .iter()
            .map(|p| p.op.clone())
            .chain(running)
            .chain(state.errors.values().map(|e| e.op.clone()))
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.queued.is_empty() && state.running.is_empty()
    }
}
