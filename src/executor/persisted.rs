//! Persisted Queue
//!
//! Durability wrapper around an `ExecutionQueue`. Under `base_dir` on one
//! storage backend it keeps:
//! - the **done log** and **error log**, append-only completion records written
//!   by a `JournalWriter` (audit only, never read back to rebuild state);
//! - the **remaining-ops file**, the encoded operations that have not completed
//!   successfully. New operations are appended to it; `checkpoint` rewrites it
//!   from the live queue. `open` rebuilds the queue from it.
//!
//! Operations completed after the last checkpoint are executed again after a
//! restart; delivery is at-least-once.
//!
//! `add_ops` and `checkpoint` are serialized by one write lock, so an add can
//! never land in the old remaining-ops file while a checkpoint replaces it.

use super::journal::JournalWriter;
use super::queue::ExecutionQueue;
use crate::config::{PersistConfig, QueueConfig};
use crate::ops::{JobId, Operation, OpsReader, encode_ops};
use crate::storage::StorageBackend;

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

pub struct PersistedQueue {
    queue: Arc<ExecutionQueue>,
    journal: Arc<JournalWriter>,
    storage: Arc<dyn StorageBackend>,
    base_dir: String,
    config: PersistConfig,
    write_lock: Mutex<()>,
}

pub fn join_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

impl PersistedQueue {
    /// Opens (or creates) the persisted queue of `job_id` under `base_dir`.
    pub fn open(
        job_id: JobId,
        storage: Arc<dyn StorageBackend>,
        base_dir: &str,
        queue_config: QueueConfig,
        config: PersistConfig,
    ) -> Result<Arc<Self>> {
        storage.mkdirs(base_dir)?;
        let queue = ExecutionQueue::new(job_id.clone(), queue_config);

        let remaining_path = join_path(base_dir, &config.remaining_ops_file);
        if storage.exists(&remaining_path)? {
            let data = storage.read_file(&remaining_path)?;
            let text = String::from_utf8_lossy(&data);
            let mut seen = HashSet::new();
            let mut ops = Vec::new();
            let mut skipped = 0usize;
            for record in OpsReader::new(&text, job_id.clone()) {
                match record {
                    Ok(op) if seen.insert(op.task_id) => ops.push(op),
                    Ok(op) => tracing::warn!("Job {}: duplicate task {} in remaining ops", job_id, op.task_id),
                    Err(e) => {
                        tracing::warn!("Job {}: skipping malformed remaining op: {}", job_id, e);
                        skipped += 1;
                    }
                }
            }
            tracing::info!(
                "Job {}: restored {} operations from {} ({} skipped)",
                job_id,
                ops.len(),
                remaining_path,
                skipped
            );
            queue.add_ops(ops)?;
        }

        let done = storage.open_write(&join_path(base_dir, &config.done_file), true)?;
        let error = storage.open_write(&join_path(base_dir, &config.error_file), true)?;
        let journal = JournalWriter::new(done, error, config.flush_interval);
        queue.add_observer(journal.clone());

        Ok(Arc::new(Self {
            queue,
            journal,
            storage,
            base_dir: base_dir.to_string(),
            config,
            write_lock: Mutex::new(()),
        }))
    }

    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }

    pub fn base_dir(&self) -> &str {
        &self.base_dir
    }

    /// Records the operations in the remaining-ops file, then enqueues them.
    /// Nothing is enqueued when the queue would reject them or the append fails.
    pub fn add_ops(&self, ops: Vec<Operation>) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.queue.validate_new_ops(&ops)?;
        let encoded = encode_ops(&ops);
        self.storage.write_append_to_file(&self.remaining_path(), encoded.as_bytes())?;
        self.queue.add_ops(ops)?;
        Ok(())
    }

    fn remaining_path(&self) -> String {
        join_path(&self.base_dir, &self.config.remaining_ops_file)
    }

    /// Forces buffered completion records out to the backend.
    pub fn flush(&self) -> Result<()> {
        self.journal.flush()
    }

    /// Rewrites the remaining-ops file from the live queue through a temp file
    /// and a rename. Returns the number of operations written.
    pub fn checkpoint(&self) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let remaining = self.queue.remaining_ops();
        let encoded = encode_ops(remaining.iter().map(|op| &**op));
        let path = self.remaining_path();
        let tmp_path = format!("{}.tmp", path);
        self.storage.write_file(&tmp_path, encoded.as_bytes())?;
        self.storage.rename_file(&tmp_path, &path)?;
        tracing::debug!("Job {}: checkpointed {} remaining operations", self.queue.job_id(), remaining.len());
        Ok(remaining.len())
    }

    /// Flushes the logs and checkpoints the remaining operations.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        let remaining = self.checkpoint()?;
        tracing::info!("Job {}: closed with {} remaining operations", self.queue.job_id(), remaining);
        Ok(())
    }
}

