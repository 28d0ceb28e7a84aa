//! Batch Poller / Runner
//!
//! Drains an `ExecutionQueue` into cost-bounded batches and dispatches them to a
//! pluggable `BatchExecutor`, keeping at most `max_parallel_batches` in flight.
//!
//! ## Responsibilities
//! - **Admission**: `ExecutionQueue::poll_batch` with the configured op count and
//!   byte budget (the first op of a batch is always admitted).
//! - **Backpressure**: a drained batch waits for a submission slot. If the poller
//!   is cancelled while waiting, the whole batch goes back to the front of the queue.
//! - **Result routing**: each result goes through `on_op_executed`; a result carrying
//!   an `exception`, a missing result or a failed batch goes through
//!   `on_op_unexpected_error`.
//!
//! In-flight batches are never aborted: after the loop stops, the poller waits
//! for every dispatched batch and routes its results.

use super::queue::ExecutionQueue;
use crate::config::BatchConfig;
use crate::iocost::StorageIoTracker;
use crate::ops::{ExecutionContext, ExecutionResult, Operation, TaskId, now_ms};

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub type BatchFuture = Pin<Box<dyn Future<Output = anyhow::Result<Vec<ExecutionResult>>> + Send>>;

/// Executes a batch and returns one result per operation.
///
/// An `Err` means the batch as a whole failed and no result can be trusted.
pub trait BatchExecutor: Send + Sync {
    fn execute_batch(&self, batch: Vec<Arc<Operation>>) -> BatchFuture;
}

/// Runs operations on tokio's blocking pool, at most `thread_count` at a time.
pub struct LocalBatchExecutor {
    ctx: ExecutionContext,
    workers: Arc<Semaphore>,
    tracker: Option<Arc<StorageIoTracker>>,
}

impl LocalBatchExecutor {
    pub fn new(ctx: ExecutionContext, thread_count: usize) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            workers: Arc::new(Semaphore::new(thread_count.max(1))),
            tracker: None,
        })
    }

    /// Same as `new`, also feeding every measured cost into `tracker`.
    pub fn with_tracker(ctx: ExecutionContext, thread_count: usize, tracker: Arc<StorageIoTracker>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            workers: Arc::new(Semaphore::new(thread_count.max(1))),
            tracker: Some(tracker),
        })
    }
}

/// Runs one operation on the blocking pool. A panic becomes an error result
/// with `exception` set.
pub async fn execute_blocking(ctx: ExecutionContext, op: Arc<Operation>) -> ExecutionResult {
    let start_time = now_ms();
    let task_op = op.clone();
    match tokio::task::spawn_blocking(move || task_op.execute(&ctx)).await {
        Ok(result) => result,
        Err(e) => {
            let mut result = ExecutionResult::failure(&op, start_time, format!("execution aborted: {}", e));
            result.exception = Some(e.to_string());
            result
        }
    }
}

impl BatchExecutor for LocalBatchExecutor {
    fn execute_batch(&self, batch: Vec<Arc<Operation>>) -> BatchFuture {
        let ctx = self.ctx.clone();
        let workers = self.workers.clone();
        let tracker = self.tracker.clone();
        Box::pin(async move {
            let mut handles = Vec::with_capacity(batch.len());
            for op in batch {
                let permit = workers.clone().acquire_owned().await?;
                let ctx = ctx.clone();
                handles.push(tokio::spawn(async move {
                    let result = execute_blocking(ctx, op).await;
                    drop(permit);
                    result
                }));
            }
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                let result = handle.await?;
                if let Some(tracker) = &tracker {
                    tracker.record(&result.measured_cost);
                }
                results.push(result);
            }
            Ok(results)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollerSummary {
    pub batches: usize,
    pub ops: usize,
    /// Operations handed back to the queue because the poller was cancelled.
    pub requeued: usize,
}

pub struct BatchPoller {
    queue: Arc<ExecutionQueue>,
    executor: Arc<dyn BatchExecutor>,
    config: BatchConfig,
    slots: Arc<Semaphore>,
}

impl BatchPoller {
    pub fn new(queue: Arc<ExecutionQueue>, executor: Arc<dyn BatchExecutor>, config: BatchConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_parallel_batches.max(1)));
        Self {
            queue,
            executor,
            config,
            slots,
        }
    }

    /// Runs until the queue yields an empty batch or `cancel` fires, then waits
    /// for the batches already dispatched.
    pub async fn run(&self, cancel: CancellationToken) -> PollerSummary {
        let mut summary = PollerSummary::default();
        let mut in_flight = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let batch = self
                .queue
                .poll_batch(self.config.max_batch_ops.max(1), self.config.max_batch_bytes);
            if batch.is_empty() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = self.slots.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                summary.requeued += self.requeue_batch(&batch);
                break;
            };

            summary.batches += 1;
            summary.ops += batch.len();
            let queue = self.queue.clone();
            let executor = self.executor.clone();
            in_flight.spawn(async move {
                dispatch(&queue, executor.as_ref(), batch).await;
                drop(permit);
            });

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!("Batch dispatch task failed: {}", e);
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Batch dispatch task failed: {}", e);
            }
        }
        tracing::info!(
            "Job {}: poller stopped after {} batches ({} ops, {} re-queued)",
            self.queue.job_id(),
            summary.batches,
            summary.ops,
            summary.requeued
        );
        summary
    }

    fn requeue_batch(&self, batch: &[Arc<Operation>]) -> usize {
        let task_ids: Vec<TaskId> = batch.iter().map(|op| op.task_id).collect();
        match self.queue.requeue_front(&task_ids) {
            Ok(count) => count,
            Err(e) => {
                tracing::error!("Failed to re-queue undispatched batch: {}", e);
                0
            }
        }
    }
}

/// Executes one batch and routes every outcome back into the queue.
async fn dispatch(queue: &ExecutionQueue, executor: &dyn BatchExecutor, batch: Vec<Arc<Operation>>) {
    let task_ids: Vec<TaskId> = batch.iter().map(|op| op.task_id).collect();
    match executor.execute_batch(batch).await {
        Ok(results) => {
            let mut reported = HashSet::with_capacity(results.len());
            for result in results {
                let task_id = result.task_id;
                if !reported.insert(task_id) {
                    tracing::warn!("Job {}: duplicate result for task {}", queue.job_id(), task_id);
                    continue;
                }
                let routed = if let Some(exception) = result.exception.clone() {
                    queue.on_op_unexpected_error(task_id, &exception)
                } else {
                    queue.on_op_executed(result)
                };
                if let Err(e) = routed {
                    tracing::warn!("Job {}: dropping result: {}", queue.job_id(), e);
                }
            }
            for task_id in task_ids.iter().filter(|id| !reported.contains(id)) {
                if let Err(e) = queue.on_op_unexpected_error(*task_id, "executor returned no result") {
                    tracing::warn!("Job {}: {}", queue.job_id(), e);
                }
            }
        }
        Err(e) => {
            tracing::error!("Job {}: batch of {} failed: {:#}", queue.job_id(), task_ids.len(), e);
            let message = format!("batch failed: {}", e);
            for task_id in &task_ids {
                if let Err(e) = queue.on_op_unexpected_error(*task_id, &message) {
                    tracing::warn!("Job {}: {}", queue.job_id(), e);
                }
            }
        }
    }
}
