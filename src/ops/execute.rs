//! Cost estimation and execution of operations.
//!
//! `pre_estimate_cost` is a pure function of the declared sizes. `execute`
//! performs blocking backend I/O and reports what was actually done, counting
//! every attempt (retries included) against the backend it hit.

use super::types::{ExecutionResult, OpKind, Operation, ZipEntry, now_ms};
use crate::config::ExecutorConfig;
use crate::iocost::{IoCost, PerStorageCost};
use crate::storage::types::parent_path;
use crate::storage::{RetryPolicy, StorageBackend, StorageId, StorageRegistry};

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything an operation needs to run: backends and I/O tuning.
#[derive(Clone)]
pub struct ExecutionContext {
    pub storages: Arc<StorageRegistry>,
    pub retry: RetryPolicy,
    pub chunk_size: u64,
}

impl ExecutionContext {
    pub fn new(storages: Arc<StorageRegistry>) -> Self {
        Self::from_config(storages, &ExecutorConfig::default())
    }

    pub fn from_config(storages: Arc<StorageRegistry>, config: &ExecutorConfig) -> Self {
        Self {
            storages,
            retry: config.retry.clone(),
            chunk_size: config.chunk_size.max(1),
        }
    }
}

impl Operation {
    /// Projected I/O per backend, computed without touching any backend.
    pub fn pre_estimate_cost(&self) -> PerStorageCost {
        let mut cost = PerStorageCost::new();
        match &self.kind {
            OpKind::Mkdir { storage, .. } => {
                cost.add_for(storage, &IoCost { call_count: 1, metadata_write_count: 1, ..IoCost::default() });
            }
            OpKind::CopyFile { dest_storage, src_storage, src_len, .. } => {
                cost.add_for(
                    src_storage,
                    &IoCost { io_read_len: *src_len, call_count: 2, metadata_read_count: 1, ..IoCost::default() },
                );
                cost.add_for(
                    dest_storage,
                    &IoCost { io_write_len: *src_len, call_count: 2, metadata_write_count: 1, ..IoCost::default() },
                );
            }
            OpKind::CopyFileContent { dest_storage, src_storage, src_len, .. } => {
                cost.add_for(src_storage, &IoCost { io_read_len: *src_len, call_count: 1, ..IoCost::default() });
                cost.add_for(dest_storage, &IoCost { io_write_len: *src_len, call_count: 1, ..IoCost::default() });
            }
            OpKind::ZipCopyFile { dest_storage, src_storage, entries, .. } => {
                let read: u64 = entries.iter().map(|e| e.src_len).sum();
                let headers: u64 = entries.iter().map(|e| zip_entry_header(e, e.src_len).len() as u64).sum();
                cost.add_for(
                    src_storage,
                    &IoCost { io_read_len: read, call_count: entries.len() as u64, ..IoCost::default() },
                );
                cost.add_for(
                    dest_storage,
                    &IoCost { io_write_len: read + headers, call_count: 2, metadata_write_count: 1, ..IoCost::default() },
                );
            }
            OpKind::MockSleep { .. } => {}
        }
        cost
    }

    /// Runs the operation. Failures are captured in the result, never returned or raised.
    pub fn execute(&self, ctx: &ExecutionContext) -> ExecutionResult {
        let start_time = now_ms();
        let started = Instant::now();
        let mut recorder = CostRecorder::new(ctx);

        let outcome = match &self.kind {
            OpKind::Mkdir { storage, path } => recorder.mkdirs(storage, path),
            OpKind::CopyFile { dest_storage, dest_path, src_storage, src_path, src_len } => {
                recorder.copy_file(src_storage, src_path, *src_len, dest_storage, dest_path)
            }
            OpKind::CopyFileContent { dest_storage, dest_path, src_storage, src_path, src_len } => {
                recorder.copy_content(src_storage, src_path, *src_len, dest_storage, dest_path)
            }
            OpKind::ZipCopyFile { dest_storage, dest_path, src_storage, entries } => {
                recorder.zip_copy(src_storage, entries, dest_storage, dest_path)
            }
            OpKind::MockSleep { millis } => {
                std::thread::sleep(Duration::from_millis(*millis));
                Ok(())
            }
        };

        let elapsed_millis = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(()) => tracing::debug!(
                "Executed {} task {}:{} in {}ms ({} warnings)",
                self.kind_name(),
                self.job_id,
                self.task_id,
                elapsed_millis,
                recorder.warnings.len()
            ),
            Err(e) => tracing::debug!(
                "Task {}:{} ({}) failed: {}",
                self.job_id,
                self.task_id,
                self.kind_name(),
                e
            ),
        }

        let mut result = ExecutionResult::success(self, start_time, elapsed_millis, recorder.cost);
        result.warnings = recorder.warnings;
        result.error_message = outcome.err();
        result
    }
}

/// Header written before each entry of a zip-copy archive.
pub fn zip_entry_header(entry: &ZipEntry, len: u64) -> String {
    format!("{}\n{}\n", entry.dest_entry_path, len)
}

enum CallKind {
    Data,
    MetadataRead,
    MetadataWrite,
}

struct CostRecorder<'a> {
    ctx: &'a ExecutionContext,
    cost: PerStorageCost,
    warnings: Vec<String>,
}

impl<'a> CostRecorder<'a> {
    fn new(ctx: &'a ExecutionContext) -> Self {
        Self {
            ctx,
            cost: PerStorageCost::new(),
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, warning: String) {
        tracing::warn!("{}", warning);
        self.warnings.push(warning);
    }

    /// Runs one backend call under the retry policy and records every attempt.
    fn call<T>(
        &mut self,
        storage_id: &StorageId,
        kind: CallKind,
        what: &str,
        mut call: impl FnMut(&dyn StorageBackend) -> crate::storage::backend::StorageResult<T>,
    ) -> Result<T, String> {
        let backend = self.ctx.storages.get(storage_id).map_err(|e| e.to_string())?;
        let started = Instant::now();
        let mut attempts = 0u64;
        let result = self.ctx.retry.run(what, || {
            attempts += 1;
            call(backend.as_ref())
        });
        let mut cost = IoCost {
            elapsed_millis: started.elapsed().as_millis() as u64,
            call_count: attempts,
            ..IoCost::default()
        };
        match kind {
            CallKind::Data => {}
            CallKind::MetadataRead => cost.metadata_read_count = attempts,
            CallKind::MetadataWrite => cost.metadata_write_count = attempts,
        }
        self.cost.add_for(storage_id, &cost);
        result.map_err(|e| format!("{} on {} failed: {}", what, storage_id, e))
    }

    fn mkdirs(&mut self, storage_id: &StorageId, path: &str) -> Result<(), String> {
        self.call(storage_id, CallKind::MetadataWrite, "mkdirs", |b| b.mkdirs(path))
    }

    fn mkdirs_parent(&mut self, storage_id: &StorageId, path: &str) -> Result<(), String> {
        match parent_path(path) {
            Some(parent) => self.mkdirs(storage_id, parent),
            None => Ok(()),
        }
    }

    fn open_dest(&mut self, storage_id: &StorageId, path: &str) -> Result<Box<dyn Write + Send>, String> {
        self.call(storage_id, CallKind::Data, "open_write", |b| b.open_write(path, false))
    }

    fn write_dest(
        &mut self,
        storage_id: &StorageId,
        path: &str,
        writer: &mut dyn Write,
        data: &[u8],
    ) -> Result<(), String> {
        let started = Instant::now();
        writer
            .write_all(data)
            .map_err(|e| format!("write to {}:{} failed: {}", storage_id, path, e))?;
        self.cost.add_for(
            storage_id,
            &IoCost {
                elapsed_millis: started.elapsed().as_millis() as u64,
                io_write_len: data.len() as u64,
                ..IoCost::default()
            },
        );
        Ok(())
    }

    fn finish_dest(&mut self, storage_id: &StorageId, path: &str, mut writer: Box<dyn Write + Send>) -> Result<(), String> {
        writer
            .flush()
            .map_err(|e| format!("flush of {}:{} failed: {}", storage_id, path, e))
    }

    /// Streams up to `len` bytes of the source through `sink` in chunks.
    ///
    /// A failure on the first chunk is an error; a failure or early EOF on a later
    /// chunk truncates the copy and is reported as a warning. Returns the bytes copied.
    fn stream_source(
        &mut self,
        src_storage: &StorageId,
        src_path: &str,
        len: u64,
        sink: &mut dyn FnMut(&mut Self, &[u8]) -> Result<(), String>,
    ) -> Result<u64, String> {
        let chunk_size = self.ctx.chunk_size;
        let mut offset = 0u64;
        while offset < len {
            let want = chunk_size.min(len - offset);
            let data = match self.call(src_storage, CallKind::Data, "read_at", |b| {
                b.read_at(src_path, offset, want)
            }) {
                Ok(data) => data,
                Err(e) if offset == 0 => return Err(e),
                Err(e) => {
                    self.warn(format!(
                        "truncated read of {}:{} at {}..{}: {}",
                        src_storage,
                        src_path,
                        offset,
                        offset + want,
                        e
                    ));
                    break;
                }
            };
            self.cost.add_for(
                src_storage,
                &IoCost { io_read_len: data.len() as u64, ..IoCost::default() },
            );
            sink(self, &data)?;
            offset += data.len() as u64;
            if (data.len() as u64) < want {
                self.warn(format!(
                    "truncated read of {}:{}: source ended at {} of {} bytes",
                    src_storage, src_path, offset, len
                ));
                break;
            }
        }
        Ok(offset)
    }

    fn copy_content(
        &mut self,
        src_storage: &StorageId,
        src_path: &str,
        len: u64,
        dest_storage: &StorageId,
        dest_path: &str,
    ) -> Result<(), String> {
        let mut writer = self.open_dest(dest_storage, dest_path)?;
        self.stream_source(src_storage, src_path, len, &mut |rec, data| {
            rec.write_dest(dest_storage, dest_path, writer.as_mut(), data)
        })?;
        self.finish_dest(dest_storage, dest_path, writer)
    }

    fn copy_file(
        &mut self,
        src_storage: &StorageId,
        src_path: &str,
        declared_len: u64,
        dest_storage: &StorageId,
        dest_path: &str,
    ) -> Result<(), String> {
        let info = self.call(src_storage, CallKind::MetadataRead, "path_info", |b| b.path_info(src_path))?;
        if info.is_dir {
            return Err(format!("source {}:{} is a directory", src_storage, src_path));
        }
        if info.length != declared_len {
            self.warn(format!(
                "source {}:{} length changed: declared {}, found {}",
                src_storage, src_path, declared_len, info.length
            ));
        }
        self.mkdirs_parent(dest_storage, dest_path)?;
        self.copy_content(src_storage, src_path, info.length, dest_storage, dest_path)
    }

    fn zip_copy(
        &mut self,
        src_storage: &StorageId,
        entries: &[ZipEntry],
        dest_storage: &StorageId,
        dest_path: &str,
    ) -> Result<(), String> {
        self.mkdirs_parent(dest_storage, dest_path)?;
        let mut writer = self.open_dest(dest_storage, dest_path)?;
        for entry in entries {
            let mut content = Vec::with_capacity(entry.src_len.min(16 * 1024 * 1024) as usize);
            let copied = self.stream_source(src_storage, &entry.src_path, entry.src_len, &mut |_, data| {
                content.extend_from_slice(data);
                Ok(())
            });
            match copied {
                Ok(len) => {
                    let header = zip_entry_header(entry, len);
                    self.write_dest(dest_storage, dest_path, writer.as_mut(), header.as_bytes())?;
                    self.write_dest(dest_storage, dest_path, writer.as_mut(), &content)?;
                }
                Err(e) => {
                    self.warn(format!("skipped zip entry {}: {}", entry.dest_entry_path, e));
                }
            }
        }
        self.finish_dest(dest_storage, dest_path, writer)
    }
}
