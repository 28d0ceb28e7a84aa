//! Executor Module Tests
//!
//! ## Test Scopes
//! - **ExecutionQueue**: state transitions, duplicate and wrong-job rejection, batch
//!   admission, re-queue priority, retry and purge, cost invariants (proptest).
//! - **Journal**: done/error line format, parsing, and skipping of malformed lines.
//! - **PersistedQueue**: rebuild from the remaining-ops file, checkpointing.
//! - **BatchPoller**: local execution end to end, failed batches, cancellation.
//! - **Sessions**: ownership, failover on expiry, control flags.
//! - **PollingExecutor**: the executor loop over in-process and HTTP transports.

#[cfg(test)]
mod tests {
    use crate::config::{BatchConfig, ExecutorConfig, PersistConfig, QueueConfig, SessionConfig};
    use crate::executor::client::{HttpQueueClient, InProcessTransport, QueueTransport, TransportFuture};
    use crate::executor::executor::{ExitReason, PollingExecutor};
    use crate::executor::journal::{
        JournalWriter, LogStatus, format_done_line, format_error_line, parse_log_line, read_log,
    };
    use crate::executor::persisted::PersistedQueue;
    use crate::executor::protocol::PollResponse;
    use crate::executor::queue::{ExecutionQueue, QueueObserver};
    use crate::executor::registry::{JobRegistry, JobStats, RegistryError};
    use crate::executor::runner::{BatchExecutor, BatchFuture, BatchPoller, LocalBatchExecutor};
    use crate::executor::session::{
        ControlFlags, ExecutorSessionRegistry, SessionError, SessionId, SessionInfo,
    };
    use crate::executor::types::{OpState, QueueError};
    use crate::iocost::{IoCost, PerStorageCost, StorageIoTracker};
    use crate::ops::{
        ExecutionContext, ExecutionResult, JobId, OpKind, Operation, OpsReader, TaskId, decode_ops,
        encode_ops, now_ms,
    };
    use crate::storage::backend::StorageResult;
    use crate::storage::{
        InMemoryStorage, LocalFileStorage, PathInfo, StorageBackend, StorageId, StorageRegistry,
    };

    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::sync::{Notify, Semaphore};
    use tokio_util::sync::CancellationToken;

    fn job() -> JobId {
        JobId::new("job-1")
    }

    fn sleep_op(id: u64) -> Operation {
        Operation::new(job(), TaskId(id), OpKind::MockSleep { millis: 1 })
    }

    fn mkdir_op(id: u64, path: &str) -> Operation {
        Operation::new(
            job(),
            TaskId(id),
            OpKind::Mkdir {
                storage: StorageId::new("A"),
                path: path.to_string(),
            },
        )
    }

    /// Copy of `len` bytes from S to D; its pre-estimated `io_len` is `2 * len`.
    fn copy_op(id: u64, len: u64) -> Operation {
        Operation::new(
            job(),
            TaskId(id),
            OpKind::CopyFile {
                dest_storage: StorageId::new("D"),
                dest_path: format!("/dst/f{}", id),
                src_storage: StorageId::new("S"),
                src_path: format!("/src/f{}", id),
                src_len: len,
            },
        )
    }

    fn ok_result(op: &Operation) -> ExecutionResult {
        ExecutionResult::success(op, now_ms(), 1, op.pre_estimate_cost())
    }

    fn err_result(op: &Operation, message: &str) -> ExecutionResult {
        let mut result = ExecutionResult::failure(op, now_ms(), message);
        result.measured_cost = op.pre_estimate_cost();
        result
    }

    fn task_ids(ops: &[Arc<Operation>]) -> Vec<u64> {
        ops.iter().map(|op| op.task_id.0).collect()
    }

    fn cost_of(ops: &[Arc<Operation>]) -> PerStorageCost {
        let mut cost = PerStorageCost::new();
        for op in ops {
            cost.incr(&op.pre_estimate_cost());
        }
        cost
    }

    // ============================================================
    // TEST 1: ExecutionQueue - State Machine
    // ============================================================

    #[test]
    fn test_mkdir_success_is_accounted_as_done() {
        // ARRANGE
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_op(mkdir_op(1, "/x")).unwrap();

        // ACT
        let op = queue.poll().expect("one queued op");
        let cost = PerStorageCost::single(
            StorageId::new("A"),
            IoCost {
                metadata_write_count: 1,
                ..IoCost::default()
            },
        );
        queue
            .on_op_executed(ExecutionResult::success(&op, now_ms(), 2, cost))
            .unwrap();

        // ASSERT
        let stats = queue.stats();
        assert_eq!(stats.done, 1);
        assert_eq!(stats.error, 0);
        assert_eq!(stats.done_cost.get(&StorageId::new("A")).metadata_write_count, 1);
        assert!(stats.queued_cost.is_empty());
        assert!(stats.running_cost.is_empty());
        assert_eq!(queue.op_state(TaskId(1)), Some(OpState::Done));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_add_ops_rejects_duplicates_atomically() {
        // ARRANGE
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_ops(vec![sleep_op(1), sleep_op(2)]).unwrap();

        // ACT
        let against_queue = queue.add_ops(vec![sleep_op(3), sleep_op(1)]);
        let within_batch = queue.add_ops(vec![sleep_op(5), sleep_op(5)]);

        // ASSERT: nothing from either rejected batch was queued
        assert_eq!(
            against_queue,
            Err(QueueError::DuplicateTask {
                job_id: job(),
                task_id: TaskId(1)
            })
        );
        assert!(matches!(within_batch, Err(QueueError::DuplicateTask { .. })));
        let stats = queue.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.total_added, 2);
        assert_eq!(queue.op_state(TaskId(3)), None);
    }

    #[test]
    fn test_add_ops_rejects_operation_of_other_job() {
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        let foreign = Operation::new(JobId::new("other"), TaskId(1), OpKind::MockSleep { millis: 0 });

        let result = queue.add_op(foreign);

        assert!(matches!(result, Err(QueueError::WrongJob { .. })));
        assert_eq!(queue.stats().total_added, 0);
    }

    #[test]
    fn test_poll_batch_respects_byte_budget_but_admits_first_op() {
        // ARRANGE: budget 100 bytes; first op estimates 120 on its own
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue
            .add_ops(vec![copy_op(1, 60), copy_op(2, 10), copy_op(3, 10)])
            .unwrap();

        // ACT
        let first = queue.poll_batch(10, 100);
        let second = queue.poll_batch(10, 100);

        // ASSERT
        assert_eq!(task_ids(&first), vec![1]);
        assert_eq!(task_ids(&second), vec![2, 3]);
        assert!(queue.poll_batch(10, 100).is_empty());
        assert_eq!(queue.stats().running_cost, cost_of(&queue.running_ops()));
    }

    #[test]
    fn test_poll_batch_respects_op_count() {
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_ops((1..=5).map(sleep_op).collect()).unwrap();

        assert_eq!(task_ids(&queue.poll_batch(2, u64::MAX)), vec![1, 2]);
        assert_eq!(task_ids(&queue.poll_batch(2, u64::MAX)), vec![3, 4]);
        assert_eq!(queue.stats().queued, 1);
    }

    #[test]
    fn test_requeue_front_preserves_order_ahead_of_queue() {
        // ARRANGE
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_ops((1..=4).map(sleep_op).collect()).unwrap();
        let polled = queue.poll_batch(2, u64::MAX);
        assert_eq!(task_ids(&polled), vec![1, 2]);

        // ACT
        let requeued = queue.requeue_front(&[TaskId(1), TaskId(2)]).unwrap();

        // ASSERT
        assert_eq!(requeued, 2);
        assert_eq!(task_ids(&queue.queued_ops()), vec![1, 2, 3, 4]);
        assert_eq!(queue.op_state(TaskId(2)), Some(OpState::Queued));
        assert!(queue.stats().running_cost.is_empty());
    }

    #[test]
    fn test_requeue_of_task_not_running_fails() {
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_op(sleep_op(1)).unwrap();

        assert!(matches!(queue.on_op_requeue(TaskId(1)), Err(QueueError::NotRunning { .. })));
        assert!(matches!(queue.on_op_requeue(TaskId(9)), Err(QueueError::NotRunning { .. })));
    }

    #[test]
    fn test_completion_of_task_not_running_fails() {
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        let op = sleep_op(1);
        queue.add_op(op.clone()).unwrap();

        let result = queue.on_op_executed(ok_result(&op));

        assert!(matches!(result, Err(QueueError::NotRunning { .. })));
        assert_eq!(queue.stats().queued, 1);
    }

    #[test]
    fn test_error_then_retry_then_purge() {
        // ARRANGE
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_ops(vec![copy_op(1, 5), copy_op(2, 7)]).unwrap();
        let polled = queue.poll_batch(2, u64::MAX);
        let failed_cost = polled[0].pre_estimate_cost();

        // ACT: one failure, one success
        queue.on_op_executed(err_result(&polled[0], "disk full")).unwrap();
        queue.on_op_executed(ok_result(&polled[1])).unwrap();

        // ASSERT
        let stats = queue.stats();
        assert_eq!((stats.done, stats.error), (1, 1));
        assert_eq!(stats.error_cost, failed_cost);
        assert_eq!(stats.done_cost, cost_of(&polled));
        assert_eq!(queue.error_ops()[0].1, "disk full");

        // ACT: retry moves the error back to the tail
        assert_eq!(queue.retry_error_ops(), 1);

        // ASSERT
        let stats = queue.stats();
        assert_eq!((stats.queued, stats.error), (1, 0));
        assert!(stats.error_cost.is_empty());
        assert_eq!(stats.queued_cost, failed_cost);
        assert_eq!(queue.op_state(TaskId(1)), Some(OpState::Queued));

        // ACT: purge hands back the retained done op
        let purged = queue.purge_done_ops();

        // ASSERT
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].op.task_id, TaskId(2));
        let stats = queue.stats();
        assert_eq!((stats.done, stats.done_total, stats.removed), (0, 1, 1));
        assert_eq!(queue.op_state(TaskId(2)), None);
    }

    #[test]
    fn test_unexpected_error_has_no_cost() {
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_op(copy_op(1, 10)).unwrap();
        queue.poll().unwrap();

        queue.on_op_unexpected_error(TaskId(1), "worker died").unwrap();

        let stats = queue.stats();
        assert_eq!(stats.error, 1);
        assert!(stats.error_cost.is_empty());
        assert!(stats.running_cost.is_empty());
        assert_eq!(queue.error_ops()[0].1, "worker died");
        assert!(queue.on_op_unexpected_error(TaskId(1), "again").is_err());
    }

    #[test]
    fn test_done_ops_not_retained_count_as_removed() {
        let queue = ExecutionQueue::new(job(), QueueConfig { keep_done_ops: false });
        queue.add_op(sleep_op(1)).unwrap();
        let op = queue.poll().unwrap();

        queue.on_op_executed(ok_result(&op)).unwrap();

        let stats = queue.stats();
        assert_eq!((stats.done, stats.done_total, stats.removed), (0, 1, 1));
        assert_eq!(queue.op_state(TaskId(1)), None);
        assert!(queue.purge_done_ops().is_empty());
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl QueueObserver for RecordingObserver {
        fn on_add_ops(&self, ops: &[Arc<Operation>]) {
            self.events.lock().push(format!("add:{}", ops.len()));
        }

        fn on_op_executed_success(&self, op: &Operation, _result: &ExecutionResult) {
            self.events.lock().push(format!("ok:{}", op.task_id));
        }

        fn on_op_executed_error(&self, op: &Operation, _result: &ExecutionResult) {
            self.events.lock().push(format!("err:{}", op.task_id));
        }

        fn on_op_unexpected_error(&self, op: &Operation, _error: &str) {
            self.events.lock().push(format!("unexpected:{}", op.task_id));
        }

        fn on_op_requeue(&self, op: &Operation) {
            self.events.lock().push(format!("requeue:{}", op.task_id));
        }
    }

    #[test]
    fn test_observers_see_every_transition() {
        // ARRANGE
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        let observer = Arc::new(RecordingObserver::default());
        queue.add_observer(observer.clone());

        // ACT
        queue.add_ops((1..=4).map(sleep_op).collect()).unwrap();
        let polled = queue.poll_batch(4, u64::MAX);
        queue.on_op_executed(ok_result(&polled[0])).unwrap();
        queue.on_op_executed(err_result(&polled[1], "nope")).unwrap();
        queue.on_op_unexpected_error(TaskId(3), "boom").unwrap();
        queue.on_op_requeue(TaskId(4)).unwrap();

        // ASSERT
        assert_eq!(
            *observer.events.lock(),
            vec!["add:4", "ok:1", "err:2", "unexpected:3", "requeue:4"]
        );
    }

    #[derive(Debug, Clone)]
    enum Action {
        Poll(usize),
        Succeed,
        Fail,
        Crash,
        RequeueAll,
        Retry,
        Purge,
    }

    fn arb_action() -> impl Strategy<Value = Action> {
        prop_oneof![
            (1usize..4).prop_map(Action::Poll),
            Just(Action::Succeed),
            Just(Action::Fail),
            Just(Action::Crash),
            Just(Action::RequeueAll),
            Just(Action::Retry),
            Just(Action::Purge),
        ]
    }

    proptest! {
        #[test]
        fn prop_costs_and_counts_stay_consistent(
            lens in prop::collection::vec(0u64..1000, 1..20),
            actions in prop::collection::vec(arb_action(), 1..60),
        ) {
            let queue = ExecutionQueue::new(job(), QueueConfig::default());
            let ops: Vec<Operation> = lens.iter().enumerate().map(|(i, len)| copy_op(i as u64 + 1, *len)).collect();
            queue.add_ops(ops).unwrap();
            let mut done_cost = PerStorageCost::new();

            for action in actions {
                match action {
                    Action::Poll(n) => {
                        queue.poll_batch(n, 1500);
                    }
                    Action::Succeed => {
                        if let Some(op) = queue.running_ops().first() {
                            done_cost.incr(&op.pre_estimate_cost());
                            queue.on_op_executed(ok_result(op)).unwrap();
                        }
                    }
                    Action::Fail => {
                        if let Some(op) = queue.running_ops().first() {
                            done_cost.incr(&op.pre_estimate_cost());
                            queue.on_op_executed(err_result(op, "failed")).unwrap();
                        }
                    }
                    Action::Crash => {
                        if let Some(op) = queue.running_ops().first() {
                            queue.on_op_unexpected_error(op.task_id, "crashed").unwrap();
                        }
                    }
                    Action::RequeueAll => {
                        let ids: Vec<TaskId> = queue.running_ops().iter().map(|op| op.task_id).collect();
                        if !ids.is_empty() {
                            queue.requeue_front(&ids).unwrap();
                        }
                    }
                    Action::Retry => {
                        queue.retry_error_ops();
                    }
                    Action::Purge => {
                        queue.purge_done_ops();
                    }
                }

                let stats = queue.stats();
                prop_assert_eq!(&stats.queued_cost, &cost_of(&queue.queued_ops()));
                prop_assert_eq!(&stats.running_cost, &cost_of(&queue.running_ops()));
                prop_assert_eq!(&stats.done_cost, &done_cost);
                prop_assert_eq!(
                    (stats.queued + stats.running + stats.done + stats.error) as u64 + stats.removed,
                    stats.total_added
                );
            }
        }
    }

    // ============================================================
    // TEST 2: Journal - Line Format
    // ============================================================

    #[test]
    fn test_done_line_with_warnings_round_trips() {
        // ARRANGE
        let op = copy_op(7, 3);
        let mut result = ExecutionResult::success(&op, 1_000, 25, op.pre_estimate_cost());
        result.warnings.push("length changed: 3 -> 4".to_string());

        // ACT
        let line = format_done_line(&result);
        let record = parse_log_line(line.trim_end()).unwrap();

        // ASSERT
        assert!(line.starts_with("W:7:1000:25:length changed  3 -> 4:"));
        assert_eq!(record.status, LogStatus::Warning);
        assert_eq!(record.task_id, TaskId(7));
        assert_eq!(record.elapsed_millis, 25);
        assert_eq!(record.warnings, vec!["length changed  3 -> 4".to_string()]);
        assert_eq!(record.cost, op.pre_estimate_cost());
        assert_eq!(record.error_message, None);
    }

    #[test]
    fn test_done_line_format_without_warnings() {
        let op = mkdir_op(3, "/x");
        let result = ExecutionResult::success(&op, 5, 6, op.pre_estimate_cost());

        assert_eq!(format_done_line(&result), "-:3:5:6::A=0,0,0,1,0,1\n");
    }

    #[test]
    fn test_error_line_keeps_colons_in_message() {
        let line = format_error_line(TaskId(4), 10, 20, &PerStorageCost::new(), "open failed: /a:b\nretry");

        let record = parse_log_line(line.trim_end()).unwrap();

        assert_eq!(line, "E:4:10:20::open failed: /a:b retry\n");
        assert_eq!(record.status, LogStatus::Error);
        assert_eq!(record.error_message.as_deref(), Some("open failed: /a:b retry"));
        assert!(record.cost.is_empty());
    }

    #[test]
    fn test_read_log_skips_malformed_lines() {
        let text = "-:1:5:6::A=0,0,0,1,0,1\n\
                    garbage\n\
                    X:2:5:6::\n\
                    -:abc:5:6::\n\
                    -:3:5:6::A=1,2\n\
                    \n\
                    E:4:1:2::boom\n";

        let report = read_log(text);

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[1].task_id, TaskId(4));
        let bad_lines: Vec<usize> = report.malformed.iter().map(|(line, _)| *line).collect();
        assert_eq!(bad_lines, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_journal_writer_appends_to_both_logs() {
        // ARRANGE
        let storage = InMemoryStorage::new();
        let journal = JournalWriter::new(
            storage.open_write("/done.log", true).unwrap(),
            storage.open_write("/error.log", true).unwrap(),
            Duration::from_secs(3600),
        );
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_observer(journal.clone());
        queue.add_ops((1..=3).map(sleep_op).collect()).unwrap();
        let polled = queue.poll_batch(3, u64::MAX);

        // ACT
        queue.on_op_executed(ok_result(&polled[0])).unwrap();
        queue.on_op_executed(err_result(&polled[1], "bad")).unwrap();
        queue.on_op_unexpected_error(TaskId(3), "lost").unwrap();
        journal.flush().unwrap();

        // ASSERT
        let done = read_log(&String::from_utf8(storage.read_file("/done.log").unwrap()).unwrap());
        let errors = read_log(&String::from_utf8(storage.read_file("/error.log").unwrap()).unwrap());
        assert_eq!(done.records.len(), 1);
        assert_eq!(done.records[0].status, LogStatus::Ok);
        let messages: Vec<&str> = errors.records.iter().filter_map(|r| r.error_message.as_deref()).collect();
        assert_eq!(messages, vec!["bad", "lost"]);
    }

    // ============================================================
    // TEST 3: PersistedQueue - Recovery and Checkpoint
    // ============================================================

    fn fast_persist() -> PersistConfig {
        PersistConfig {
            flush_interval: Duration::ZERO,
            ..PersistConfig::default()
        }
    }

    #[test]
    fn test_persisted_queue_checkpoint_and_reopen() {
        // ARRANGE
        let storage: Arc<dyn StorageBackend> = InMemoryStorage::new();
        let persisted =
            PersistedQueue::open(job(), storage.clone(), "/jobs/job-1", QueueConfig::default(), fast_persist()).unwrap();
        persisted.add_ops((1..=3).map(|id| copy_op(id, 4)).collect()).unwrap();
        let op = persisted.queue().poll().unwrap();
        persisted.queue().on_op_executed(ok_result(&op)).unwrap();

        // ACT
        let written = persisted.checkpoint().unwrap();
        persisted.close().unwrap();
        let reopened =
            PersistedQueue::open(job(), storage.clone(), "/jobs/job-1", QueueConfig::default(), fast_persist()).unwrap();

        // ASSERT
        assert_eq!(written, 2);
        let stats = reopened.queue().stats();
        assert_eq!((stats.queued, stats.total_added), (2, 2));
        assert!(stats.done_cost.is_empty());
        assert_eq!(task_ids(&reopened.queue().queued_ops()), vec![2, 3]);
        let done_log = String::from_utf8(storage.read_file("/jobs/job-1/done.log").unwrap()).unwrap();
        assert_eq!(read_log(&done_log).records[0].task_id, TaskId(1));
    }

    #[test]
    fn test_persisted_queue_without_checkpoint_replays_completed_ops() {
        let storage: Arc<dyn StorageBackend> = InMemoryStorage::new();
        let persisted =
            PersistedQueue::open(job(), storage.clone(), "/q", QueueConfig::default(), fast_persist()).unwrap();
        persisted.add_ops(vec![sleep_op(1), sleep_op(2)]).unwrap();
        let op = persisted.queue().poll().unwrap();
        persisted.queue().on_op_executed(ok_result(&op)).unwrap();

        let reopened = PersistedQueue::open(job(), storage, "/q", QueueConfig::default(), fast_persist()).unwrap();

        assert_eq!(task_ids(&reopened.queue().queued_ops()), vec![1, 2]);
    }

    #[test]
    fn test_persisted_queue_skips_malformed_records() {
        // ARRANGE
        let storage: Arc<dyn StorageBackend> = InMemoryStorage::new();
        storage.mkdirs("/q").unwrap();
        let text = format!(
            "{}garbage\n{}{}",
            encode_ops(&[sleep_op(1)]),
            encode_ops(&[sleep_op(2)]),
            encode_ops(&[sleep_op(1)])
        );
        storage.write_file("/q/remaining-ops.txt", text.as_bytes()).unwrap();

        // ACT
        let persisted = PersistedQueue::open(job(), storage, "/q", QueueConfig::default(), fast_persist()).unwrap();

        // ASSERT: bad line and duplicate dropped
        assert_eq!(task_ids(&persisted.queue().queued_ops()), vec![1, 2]);
    }

    #[test]
    fn test_persisted_queue_on_local_disk() {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalFileStorage::new(dir.path()));
        {
            let persisted =
                PersistedQueue::open(job(), storage.clone(), "/jobs/a", QueueConfig::default(), fast_persist()).unwrap();
            persisted.add_ops(vec![mkdir_op(1, "/one"), mkdir_op(2, "/two")]).unwrap();
            persisted.close().unwrap();
        }

        let reopened = PersistedQueue::open(job(), storage, "/jobs/a", QueueConfig::default(), fast_persist()).unwrap();

        assert_eq!(reopened.queue().stats().queued, 2);
        assert!(dir.path().join("jobs/a/remaining-ops.txt").exists());
    }

    /// Delegates to an in-memory backend; the first temp-file write runs `hook`
    /// and then pauses, leaving a window before the checkpoint's rename.
    struct PausingStorage {
        inner: Arc<InMemoryStorage>,
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl StorageBackend for PausingStorage {
        fn exists(&self, path: &str) -> StorageResult<bool> {
            self.inner.exists(path)
        }

        fn path_info(&self, path: &str) -> StorageResult<PathInfo> {
            self.inner.path_info(path)
        }

        fn list(&self, path: &str) -> StorageResult<Vec<PathInfo>> {
            self.inner.list(path)
        }

        fn mkdirs(&self, path: &str) -> StorageResult<()> {
            self.inner.mkdirs(path)
        }

        fn delete_file(&self, path: &str) -> StorageResult<()> {
            self.inner.delete_file(path)
        }

        fn rename_file(&self, old_path: &str, new_path: &str) -> StorageResult<()> {
            self.inner.rename_file(old_path, new_path)
        }

        fn open_read(&self, path: &str, offset: u64) -> StorageResult<Box<dyn std::io::Read + Send>> {
            self.inner.open_read(path, offset)
        }

        fn open_write(&self, path: &str, append: bool) -> StorageResult<Box<dyn std::io::Write + Send>> {
            self.inner.open_write(path, append)
        }

        fn write_file(&self, path: &str, data: &[u8]) -> StorageResult<()> {
            if path.ends_with(".tmp") {
                let hook = self.hook.lock().take();
                if let Some(hook) = hook {
                    hook();
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
            self.inner.write_file(path, data)
        }
    }

    #[test]
    fn test_add_during_checkpoint_survives_restart() {
        // ARRANGE
        let inner = InMemoryStorage::new();
        let storage = Arc::new(PausingStorage {
            inner: inner.clone(),
            hook: Mutex::new(None),
        });
        let persisted =
            PersistedQueue::open(job(), storage.clone(), "/q", QueueConfig::default(), fast_persist()).unwrap();
        persisted.add_ops(vec![sleep_op(1)]).unwrap();

        let adder: Arc<Mutex<Option<std::thread::JoinHandle<bool>>>> = Arc::new(Mutex::new(None));
        let racing = persisted.clone();
        let slot = adder.clone();
        *storage.hook.lock() = Some(Box::new(move || {
            let handle = std::thread::spawn(move || racing.add_ops(vec![sleep_op(2)]).is_ok());
            *slot.lock() = Some(handle);
        }));

        // ACT: the concurrent add is issued while the temp file is being written
        persisted.checkpoint().unwrap();
        let handle = adder.lock().take().expect("hook ran");
        assert!(handle.join().unwrap());
        let reopened = PersistedQueue::open(job(), inner, "/q", QueueConfig::default(), fast_persist()).unwrap();

        // ASSERT
        assert_eq!(task_ids(&persisted.queue().queued_ops()), vec![1, 2]);
        assert_eq!(task_ids(&reopened.queue().queued_ops()), vec![1, 2]);
    }

    #[test]
    fn test_failed_append_enqueues_nothing() {
        // ARRANGE
        let storage = InMemoryStorage::new();
        let persisted =
            PersistedQueue::open(job(), storage.clone(), "/q", QueueConfig::default(), fast_persist()).unwrap();
        persisted.add_ops(vec![sleep_op(1)]).unwrap();

        // ACT
        storage.inject_failures(1);
        let failed = persisted.add_ops(vec![sleep_op(2)]);
        let retried = persisted.add_ops(vec![sleep_op(2)]);

        // ASSERT: the retry is accepted, not rejected as a duplicate
        assert!(failed.is_err());
        assert!(retried.is_ok());
        assert_eq!(persisted.queue().stats().total_added, 2);
        let reopened = PersistedQueue::open(job(), storage, "/q", QueueConfig::default(), fast_persist()).unwrap();
        assert_eq!(task_ids(&reopened.queue().queued_ops()), vec![1, 2]);
    }

    #[test]
    fn test_rejected_add_is_not_written() {
        let storage = InMemoryStorage::new();
        let persisted =
            PersistedQueue::open(job(), storage.clone(), "/q", QueueConfig::default(), fast_persist()).unwrap();
        persisted.add_ops(vec![sleep_op(1)]).unwrap();

        let duplicate = persisted.add_ops(vec![sleep_op(2), sleep_op(1)]);

        assert!(duplicate.is_err());
        let text = String::from_utf8(storage.read_file("/q/remaining-ops.txt").unwrap()).unwrap();
        assert_eq!(OpsReader::new(&text, job()).count(), 1);
    }

    #[test]
    fn test_resent_done_records_do_not_count_on_reopen() {
        // ARRANGE
        let storage: Arc<dyn StorageBackend> = InMemoryStorage::new();
        let persisted =
            PersistedQueue::open(job(), storage.clone(), "/q", QueueConfig::default(), fast_persist()).unwrap();
        persisted.add_ops((1..=3).map(|id| copy_op(id, 4)).collect()).unwrap();
        let op = persisted.queue().poll().unwrap();
        let result = ok_result(&op);
        persisted.queue().on_op_executed(result.clone()).unwrap();
        persisted.close().unwrap();

        // ACT: the same completion is appended again, as after a crash and resend
        storage
            .write_append_to_file("/q/done.log", format_done_line(&result).as_bytes())
            .unwrap();
        let reopened = PersistedQueue::open(job(), storage.clone(), "/q", QueueConfig::default(), fast_persist()).unwrap();

        // ASSERT
        let done_log = String::from_utf8(storage.read_file("/q/done.log").unwrap()).unwrap();
        let records = read_log(&done_log).records;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.task_id == TaskId(1)));
        let stats = reopened.queue().stats();
        assert!(stats.done_cost.is_empty());
        assert_eq!((stats.done_total, stats.total_added), (0, 2));
        assert_eq!(task_ids(&reopened.queue().queued_ops()), vec![2, 3]);
    }

    // ============================================================
    // TEST 4: BatchPoller - Local Execution
    // ============================================================

    fn copy_fixture(count: u64) -> (ExecutionContext, Arc<InMemoryStorage>, Vec<Operation>) {
        let src = InMemoryStorage::new();
        let dst = InMemoryStorage::new();
        src.mkdirs("/src").unwrap();
        let mut ops = Vec::new();
        for id in 1..=count {
            let content = vec![b'x'; id as usize];
            src.write_file(&format!("/src/f{}", id), &content).unwrap();
            ops.push(copy_op(id, id));
        }
        let storages = StorageRegistry::new();
        storages.register(StorageId::new("S"), src);
        storages.register(StorageId::new("D"), dst.clone());
        (ExecutionContext::new(storages), dst, ops)
    }

    #[tokio::test]
    async fn test_batch_poller_executes_everything() {
        // ARRANGE
        let (ctx, dst, ops) = copy_fixture(10);
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_ops(ops).unwrap();
        let tracker = StorageIoTracker::new();
        let executor = LocalBatchExecutor::with_tracker(ctx, 2, tracker.clone());
        let config = BatchConfig {
            max_batch_ops: 3,
            max_batch_bytes: u64::MAX,
            max_parallel_batches: 2,
        };

        // ACT
        let summary = BatchPoller::new(queue.clone(), executor, config)
            .run(CancellationToken::new())
            .await;

        // ASSERT
        assert_eq!((summary.batches, summary.ops, summary.requeued), (4, 10, 0));
        let stats = queue.stats();
        assert_eq!((stats.done, stats.error), (10, 0));
        assert_eq!(dst.file_count(), 10);
        assert_eq!(tracker.total_for(&StorageId::new("D")).io_write_len, 55);
        assert_eq!(stats.done_cost.get(&StorageId::new("S")).io_read_len, 55);
    }

    struct FailingExecutor;

    impl BatchExecutor for FailingExecutor {
        fn execute_batch(&self, _batch: Vec<Arc<Operation>>) -> BatchFuture {
            Box::pin(async { Err(anyhow::anyhow!("cluster unreachable")) })
        }
    }

    struct SilentExecutor;

    impl BatchExecutor for SilentExecutor {
        fn execute_batch(&self, batch: Vec<Arc<Operation>>) -> BatchFuture {
            // Answers for the first op only.
            let results = batch.first().map(|op| ok_result(op)).into_iter().collect();
            Box::pin(async move { Ok(results) })
        }
    }

    #[tokio::test]
    async fn test_failed_batch_routes_every_op_to_unexpected_error() {
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_ops((1..=4).map(sleep_op).collect()).unwrap();

        BatchPoller::new(queue.clone(), Arc::new(FailingExecutor), BatchConfig::default())
            .run(CancellationToken::new())
            .await;

        let errors = queue.error_ops();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().all(|(_, message)| message.contains("cluster unreachable")));
        assert!(queue.stats().error_cost.is_empty());
    }

    #[tokio::test]
    async fn test_missing_results_become_unexpected_errors() {
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_ops((1..=3).map(sleep_op).collect()).unwrap();

        BatchPoller::new(queue.clone(), Arc::new(SilentExecutor), BatchConfig::default())
            .run(CancellationToken::new())
            .await;

        let stats = queue.stats();
        assert_eq!((stats.done, stats.error), (1, 2));
        assert!(
            queue
                .error_ops()
                .iter()
                .all(|(_, message)| message == "executor returned no result")
        );
    }

    /// Holds every batch until the gate opens.
    struct GatedExecutor {
        gate: Arc<Semaphore>,
        started: Arc<Notify>,
    }

    impl BatchExecutor for GatedExecutor {
        fn execute_batch(&self, batch: Vec<Arc<Operation>>) -> BatchFuture {
            let gate = self.gate.clone();
            let started = self.started.clone();
            Box::pin(async move {
                started.notify_one();
                let _permit = gate.acquire_owned().await?;
                Ok(batch.iter().map(|op| ok_result(op)).collect())
            })
        }
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_slot_requeues_batch() {
        // ARRANGE: one slot, held by the first batch
        let queue = ExecutionQueue::new(job(), QueueConfig::default());
        queue.add_ops((1..=4).map(sleep_op).collect()).unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(Notify::new());
        let executor = Arc::new(GatedExecutor {
            gate: gate.clone(),
            started: started.clone(),
        });
        let poller = BatchPoller::new(queue.clone(), executor, BatchConfig::single_op(1));
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { poller.run(cancel).await }
        });

        // ACT
        started.notified().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        gate.add_permits(1);
        let summary = run.await.unwrap();

        // ASSERT
        assert_eq!((summary.batches, summary.requeued), (1, 1));
        assert_eq!(queue.op_state(TaskId(1)), Some(OpState::Done));
        assert_eq!(task_ids(&queue.queued_ops()), vec![2, 3, 4]);
        assert!(queue.stats().running_cost.is_empty());
    }

    // ============================================================
    // TEST 5: Sessions - Ownership and Failover
    // ============================================================

    fn session_config() -> SessionConfig {
        SessionConfig {
            liveness_timeout: Duration::from_secs(60),
            check_interval: Duration::from_secs(10),
        }
    }

    fn session_info(id: &str) -> SessionInfo {
        SessionInfo {
            session_id: SessionId::new(id),
            host: "worker-host".to_string(),
            start_time: now_ms(),
            props: BTreeMap::new(),
        }
    }

    fn server_with_ops(count: u64) -> (Arc<JobRegistry>, Arc<ExecutorSessionRegistry>) {
        let jobs = JobRegistry::new(QueueConfig::default());
        let entry = jobs.create_job(job()).unwrap();
        entry.add_ops((1..=count).map(sleep_op).collect()).unwrap();
        let sessions = ExecutorSessionRegistry::new(jobs.clone(), session_config());
        (jobs, sessions)
    }

    fn job_queue(jobs: &JobRegistry) -> Arc<ExecutionQueue> {
        jobs.job(&job()).unwrap().queue().clone()
    }

    #[test]
    fn test_expired_session_tasks_are_requeued_in_poll_order() {
        // ARRANGE
        let (jobs, sessions) = server_with_ops(3);
        let s1 = SessionId::new("s1");
        sessions.start(session_info("s1")).unwrap();
        let polled = sessions.poll_next(&s1, Vec::new(), 3).unwrap();
        assert_eq!(polled.ops.len(), 3);
        assert_eq!(sessions.owned_tasks(&s1).unwrap().len(), 3);

        // ACT
        let expired = sessions.expire_dead_sessions_at(Instant::now() + Duration::from_secs(61));

        // ASSERT
        assert_eq!(expired, vec![s1.clone()]);
        assert!(sessions.sessions().is_empty());
        let queue = job_queue(&jobs);
        assert_eq!(task_ids(&queue.queued_ops()), vec![1, 2, 3]);
        assert_eq!(queue.stats().running, 0);

        // ACT: another session picks them up in the same order
        sessions.start(session_info("s2")).unwrap();
        let retaken = sessions.poll_next(&SessionId::new("s2"), Vec::new(), 3).unwrap();

        // ASSERT
        let ids: Vec<u64> = retaken.ops.iter().map(|op| op.task_id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(matches!(
            sessions.poll_next(&s1, Vec::new(), 1),
            Err(SessionError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_live_session_is_not_expired() {
        let (_jobs, sessions) = server_with_ops(1);
        sessions.start(session_info("s1")).unwrap();

        assert!(sessions.expire_dead_sessions_at(Instant::now() + Duration::from_secs(30)).is_empty());
        assert_eq!(sessions.sessions().len(), 1);
    }

    #[test]
    fn test_results_from_non_owner_are_ignored() {
        // ARRANGE
        let (jobs, sessions) = server_with_ops(1);
        let (s1, s2) = (SessionId::new("s1"), SessionId::new("s2"));
        sessions.start(session_info("s1")).unwrap();
        sessions.start(session_info("s2")).unwrap();
        let op = sessions.poll_next(&s1, Vec::new(), 1).unwrap().ops.remove(0);

        // ACT
        sessions.poll_next(&s2, vec![ok_result(&op)], 0).unwrap();

        // ASSERT
        let queue = job_queue(&jobs);
        assert_eq!(queue.stats().running, 1);

        // ACT: the owner reports
        sessions.poll_next(&s1, vec![ok_result(&op)], 0).unwrap();

        // ASSERT
        assert_eq!(queue.stats().done, 1);
        assert!(sessions.owned_tasks(&s1).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_session_start_is_rejected() {
        let (_jobs, sessions) = server_with_ops(0);
        sessions.start(session_info("s1")).unwrap();

        let second = sessions.start(session_info("s1"));

        assert_eq!(second, Err(SessionError::DuplicateSession(SessionId::new("s1"))));
    }

    #[test]
    fn test_control_flags_block_polling() {
        // ARRANGE
        let (_jobs, sessions) = server_with_ops(3);
        let s1 = SessionId::new("s1");
        sessions.start(session_info("s1")).unwrap();
        let suspend = ControlFlags {
            polling_suspend_requested: true,
            ..ControlFlags::default()
        };

        // ACT
        sessions.set_control(&s1, suspend).unwrap();
        let outcome = sessions.poll_next(&s1, Vec::new(), 3).unwrap();

        // ASSERT
        assert!(outcome.ops.is_empty());
        assert_eq!(outcome.control, suspend);
        assert_eq!(sessions.ping_alive(&s1).unwrap(), suspend);

        // ACT: resume
        sessions.set_control(&s1, ControlFlags::default()).unwrap();

        // ASSERT
        assert_eq!(sessions.poll_next(&s1, Vec::new(), 3).unwrap().ops.len(), 3);
    }

    #[test]
    fn test_stop_requeues_owned_tasks() {
        let (jobs, sessions) = server_with_ops(4);
        let s1 = SessionId::new("s1");
        sessions.start(session_info("s1")).unwrap();
        sessions.poll_next(&s1, Vec::new(), 2).unwrap();

        let requeued = sessions.stop(&s1, "shutdown").unwrap();

        assert_eq!(requeued, 2);
        assert_eq!(task_ids(&job_queue(&jobs).queued_ops()), vec![1, 2, 3, 4]);
        assert!(sessions.stop(&s1, "again").is_err());
    }

    #[test]
    fn test_suspended_job_is_not_polled() {
        let (jobs, sessions) = server_with_ops(2);
        let s1 = SessionId::new("s1");
        sessions.start(session_info("s1")).unwrap();
        jobs.job(&job()).unwrap().set_polling_active(false);

        assert!(sessions.poll_next(&s1, Vec::new(), 2).unwrap().ops.is_empty());
        assert!(!jobs.job(&job()).unwrap().to_stats().polling_active);

        jobs.job(&job()).unwrap().set_polling_active(true);
        assert_eq!(sessions.poll_next(&s1, Vec::new(), 2).unwrap().ops.len(), 2);
    }

    #[test]
    fn test_reported_exception_is_unexpected_error() {
        let (jobs, sessions) = server_with_ops(1);
        let s1 = SessionId::new("s1");
        sessions.start(session_info("s1")).unwrap();
        let op = sessions.poll_next(&s1, Vec::new(), 1).unwrap().ops.remove(0);
        let mut result = err_result(&op, "panicked");
        result.exception = Some("worker panicked".to_string());

        sessions.poll_next(&s1, vec![result], 0).unwrap();

        let queue = job_queue(&jobs);
        assert_eq!(queue.error_ops()[0].1, "worker panicked");
        assert!(queue.stats().error_cost.is_empty());
    }

    #[test]
    fn test_persisted_registry_keeps_jobs_on_storage() {
        let storage: Arc<dyn StorageBackend> = InMemoryStorage::new();
        let jobs = JobRegistry::with_persistence(QueueConfig::default(), storage.clone(), "/state", fast_persist());
        let entry = jobs.create_job(job()).unwrap();
        entry.add_ops(vec![sleep_op(1), sleep_op(2)]).unwrap();

        jobs.flush_all();
        let text = String::from_utf8(storage.read_file("/state/job-1/remaining-ops.txt").unwrap()).unwrap();

        assert_eq!(decode_ops(&text, &job()).unwrap().len(), 2);
        assert!(matches!(
            jobs.create_job(job()),
            Err(RegistryError::DuplicateJob(_))
        ));
        assert_eq!(OpsReader::new(&text, job()).count(), 2);

        // A fresh registry over the same storage finds the job again
        let restarted = JobRegistry::with_persistence(QueueConfig::default(), storage, "/state", fast_persist());
        assert_eq!(restarted.recover_jobs().unwrap(), vec![job()]);
        assert_eq!(restarted.job(&job()).unwrap().queue().stats().queued, 2);
    }

    #[test]
    fn test_job_ids_must_be_a_single_path_segment() {
        // ARRANGE
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base");
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalFileStorage::new(&base));
        let jobs = JobRegistry::with_persistence(QueueConfig::default(), storage, "/", fast_persist());

        // ACT
        let rejected: Vec<bool> = ["..", ".", "", "a/b", "..\\up"]
            .iter()
            .map(|id| matches!(jobs.create_job(JobId::new(*id)), Err(RegistryError::InvalidJobId(..))))
            .collect();
        let accepted = jobs.create_job(JobId::new("job-2"));

        // ASSERT: nothing was written outside the base dir
        assert_eq!(rejected, vec![true; 5]);
        assert!(accepted.is_ok());
        let outside: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(outside, vec!["base".to_string()]);
        assert!(!base.join("done.log").exists());
        assert!(base.join("job-2").is_dir());
        assert_eq!(jobs.job_ids(), vec![JobId::new("job-2")]);
    }

    // ============================================================
    // TEST 6: PollingExecutor - Executor Loop
    // ============================================================

    fn fast_executor_config() -> ExecutorConfig {
        ExecutorConfig {
            thread_count: 2,
            poll_ahead: 1,
            ping_alive_interval: Duration::from_millis(50),
            idle_poll_interval: Duration::from_millis(10),
            transport_retry_delay: Duration::from_millis(10),
            ..ExecutorConfig::default()
        }
    }

    fn empty_context() -> ExecutionContext {
        ExecutionContext::new(StorageRegistry::new())
    }

    async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn spawn_executor(
        executor: PollingExecutor,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<anyhow::Result<ExitReason>> {
        let executor = Arc::new(executor);
        tokio::spawn(async move { executor.run(cancel).await })
    }

    #[tokio::test]
    async fn test_polling_executor_runs_job_and_stops_on_request() {
        // ARRANGE
        let (jobs, sessions) = server_with_ops(8);
        let executor = PollingExecutor::new(
            InProcessTransport::new(sessions.clone()),
            empty_context(),
            fast_executor_config(),
            "test-host",
        );
        let session_id = executor.session_id().clone();
        let handle = spawn_executor(executor, CancellationToken::new());

        // ACT
        let queue = job_queue(&jobs);
        wait_for("all ops done", || queue.stats().done == 8).await;
        let stop = ControlFlags {
            stop_requested: true,
            ..ControlFlags::default()
        };
        sessions.set_control(&session_id, stop).unwrap();
        let reason = handle.await.unwrap().unwrap();

        // ASSERT
        assert_eq!(reason, ExitReason::Stopped);
        assert!(sessions.sessions().is_empty());
        assert_eq!(queue.stats().error, 0);
    }

    #[tokio::test]
    async fn test_polling_executor_cancel_drains_and_closes_session() {
        let (jobs, sessions) = server_with_ops(4);
        let executor = PollingExecutor::new(
            InProcessTransport::new(sessions.clone()),
            empty_context(),
            fast_executor_config(),
            "test-host",
        );
        let cancel = CancellationToken::new();
        let handle = spawn_executor(executor, cancel.clone());

        wait_for("session started", || !sessions.sessions().is_empty()).await;
        cancel.cancel();
        let reason = handle.await.unwrap().unwrap();

        assert_eq!(reason, ExitReason::Cancelled);
        assert!(sessions.sessions().is_empty());
        let stats = job_queue(&jobs).stats();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.queued + stats.done, 4);
    }

    #[tokio::test]
    async fn test_polling_executor_kill_leaves_session_for_liveness_check() {
        // ARRANGE
        let (jobs, sessions) = server_with_ops(0);
        let executor = PollingExecutor::new(
            InProcessTransport::new(sessions.clone()),
            empty_context(),
            fast_executor_config(),
            "test-host",
        );
        let session_id = executor.session_id().clone();
        let handle = spawn_executor(executor, CancellationToken::new());
        wait_for("session started", || !sessions.sessions().is_empty()).await;

        // ACT
        let kill = ControlFlags {
            kill_requested: true,
            ..ControlFlags::default()
        };
        sessions.set_control(&session_id, kill).unwrap();
        let reason = handle.await.unwrap().unwrap();

        // ASSERT
        assert_eq!(reason, ExitReason::Killed);
        assert_eq!(sessions.sessions().len(), 1);
        let expired = sessions.expire_dead_sessions_at(Instant::now() + Duration::from_secs(61));
        assert_eq!(expired, vec![session_id]);
        assert_eq!(job_queue(&jobs).stats().running, 0);
    }

    #[tokio::test]
    async fn test_polling_executor_exits_when_session_is_lost() {
        let (_jobs, sessions) = server_with_ops(0);
        let executor = PollingExecutor::new(
            InProcessTransport::new(sessions.clone()),
            empty_context(),
            fast_executor_config(),
            "test-host",
        );
        let session_id = executor.session_id().clone();
        let handle = spawn_executor(executor, CancellationToken::new());
        wait_for("session started", || !sessions.sessions().is_empty()).await;

        sessions.stop(&session_id, "evicted").unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), ExitReason::SessionLost);
    }

    /// Fails every other poll before it reaches the server.
    struct FlakyTransport {
        inner: Arc<InProcessTransport>,
        polls: AtomicUsize,
    }

    impl QueueTransport for FlakyTransport {
        fn start(&self, info: SessionInfo) -> TransportFuture<ControlFlags> {
            self.inner.start(info)
        }

        fn stop(&self, session_id: SessionId, reason: String) -> TransportFuture<usize> {
            self.inner.stop(session_id, reason)
        }

        fn ping_alive(&self, session_id: SessionId) -> TransportFuture<ControlFlags> {
            self.inner.ping_alive(session_id)
        }

        fn poll_next(
            &self,
            session_id: SessionId,
            results: Vec<ExecutionResult>,
            poll_count: usize,
        ) -> TransportFuture<PollResponse> {
            if self.polls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                return Box::pin(async { Err(anyhow::anyhow!("connection reset")) });
            }
            self.inner.poll_next(session_id, results, poll_count)
        }
    }

    #[tokio::test]
    async fn test_polling_executor_resends_results_after_transport_failure() {
        // ARRANGE
        let (jobs, sessions) = server_with_ops(6);
        let transport = Arc::new(FlakyTransport {
            inner: InProcessTransport::new(sessions.clone()),
            polls: AtomicUsize::new(0),
        });
        let executor = PollingExecutor::new(transport.clone(), empty_context(), fast_executor_config(), "test-host");
        let cancel = CancellationToken::new();
        let handle = spawn_executor(executor, cancel.clone());

        // ACT
        let queue = job_queue(&jobs);
        wait_for("all ops done", || queue.stats().done_total == 6).await;
        cancel.cancel();
        let reason = handle.await.unwrap().unwrap();

        // ASSERT
        assert_eq!(reason, ExitReason::Cancelled);
        assert_eq!(queue.stats().error, 0);
        assert!(transport.polls.load(Ordering::SeqCst) > 2);
    }

    // ============================================================
    // TEST 7: HTTP Surface
    // ============================================================

    async fn serve(jobs: Arc<JobRegistry>, sessions: Arc<ExecutorSessionRegistry>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::executor::handlers::router(jobs, sessions);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_http_job_endpoints() {
        // ARRANGE
        let jobs = JobRegistry::new(QueueConfig::default());
        let sessions = ExecutorSessionRegistry::new(jobs.clone(), session_config());
        let addr = serve(jobs.clone(), sessions).await;
        let http = reqwest::Client::new();
        let ops = vec![sleep_op(1), sleep_op(2)];

        // ACT
        let added = http
            .post(format!("http://{}/job/job-1/ops", addr))
            .body(encode_ops(&ops))
            .send()
            .await
            .unwrap();
        let duplicate = http
            .post(format!("http://{}/job/job-1/ops", addr))
            .body(encode_ops(&ops))
            .send()
            .await
            .unwrap();
        let malformed = http
            .post(format!("http://{}/job/job-1/ops", addr))
            .body("1:q:nonsense\n")
            .send()
            .await
            .unwrap();
        let stats: JobStats = http
            .get(format!("http://{}/job/job-1/stats", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let unknown = http
            .get(format!("http://{}/job/nope/stats", addr))
            .send()
            .await
            .unwrap();

        // ASSERT
        assert_eq!(added.status(), reqwest::StatusCode::OK);
        assert_eq!(duplicate.status(), reqwest::StatusCode::CONFLICT);
        assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(stats.queue.queued, 2);
        assert!(stats.polling_active);
        assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_http_rejects_job_id_with_separator() {
        let jobs = JobRegistry::new(QueueConfig::default());
        let sessions = ExecutorSessionRegistry::new(jobs.clone(), session_config());
        let addr = serve(jobs.clone(), sessions).await;

        let response = reqwest::Client::new()
            .post(format!("http://{}/job/a%2Fb/ops", addr))
            .body(encode_ops(&[Operation::new(JobId::new("a/b"), TaskId(1), OpKind::MockSleep { millis: 1 })]))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        assert!(jobs.job_ids().is_empty());
    }

    #[tokio::test]
    async fn test_polling_executor_over_http() {
        // ARRANGE
        let (jobs, sessions) = server_with_ops(5);
        let addr = serve(jobs.clone(), sessions.clone()).await;
        let executor = PollingExecutor::new(
            HttpQueueClient::new(&addr),
            empty_context(),
            fast_executor_config(),
            "remote-host",
        );
        let cancel = CancellationToken::new();
        let handle = spawn_executor(executor, cancel.clone());

        // ACT
        let queue = job_queue(&jobs);
        wait_for("all ops done over http", || queue.stats().done == 5).await;
        cancel.cancel();
        let reason = handle.await.unwrap().unwrap();

        // ASSERT
        assert_eq!(reason, ExitReason::Cancelled);
        assert!(sessions.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_http_client_maps_unknown_session() {
        let jobs = JobRegistry::new(QueueConfig::default());
        let sessions = ExecutorSessionRegistry::new(jobs.clone(), session_config());
        let addr = serve(jobs, sessions).await;
        let client = HttpQueueClient::new(&addr);

        let error = client.ping_alive(SessionId::new("ghost")).await.unwrap_err();

        assert_eq!(
            error.downcast_ref::<SessionError>(),
            Some(&SessionError::UnknownSession(SessionId::new("ghost")))
        );
    }
}
