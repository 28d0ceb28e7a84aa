//! Storage Capability Interface
//!
//! Every backend (local disk, object stores, data lakes) is consumed through
//! `StorageBackend`. Implementations are shared between worker threads and must
//! be safe to call concurrently; the queue holds no lock while calling them.

use super::types::{PathInfo, StorageId};

use dashmap::DashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("unknown storage: {0}")]
    UnknownStorage(StorageId),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn io(path: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(path.to_string());
        }
        Self::Io {
            path: path.to_string(),
            source,
        }
    }

    /// Missing paths and unknown storages will not fix themselves on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound(_) | Self::UnknownStorage(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Uniform capability set of a storage backend.
///
/// Paths are `/`-separated and absolute within the backend.
pub trait StorageBackend: Send + Sync {
    fn exists(&self, path: &str) -> StorageResult<bool>;

    fn path_info(&self, path: &str) -> StorageResult<PathInfo>;

    fn list(&self, path: &str) -> StorageResult<Vec<PathInfo>>;

    fn mkdirs(&self, path: &str) -> StorageResult<()>;

    fn delete_file(&self, path: &str) -> StorageResult<()>;

    fn rename_file(&self, old_path: &str, new_path: &str) -> StorageResult<()>;

    fn open_read(&self, path: &str, offset: u64) -> StorageResult<Box<dyn Read + Send>>;

    fn open_write(&self, path: &str, append: bool) -> StorageResult<Box<dyn Write + Send>>;

    fn read_file(&self, path: &str) -> StorageResult<Vec<u8>> {
        let mut reader = self.open_read(path, 0)?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| StorageError::io(path, e))?;
        Ok(data)
    }

    /// Reads up to `len` bytes starting at `offset`. A short result means
    /// the file ended before `offset + len`.
    fn read_at(&self, path: &str, offset: u64, len: u64) -> StorageResult<Vec<u8>> {
        let reader = self.open_read(path, offset)?;
        let mut data = Vec::with_capacity(len.min(16 * 1024 * 1024) as usize);
        reader
            .take(len)
            .read_to_end(&mut data)
            .map_err(|e| StorageError::io(path, e))?;
        Ok(data)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let mut writer = self.open_write(path, false)?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| StorageError::io(path, e))
    }

    fn write_append_to_file(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let mut writer = self.open_write(path, true)?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| StorageError::io(path, e))
    }
}

/// Maps storage ids to live backend instances.
#[derive(Default)]
pub struct StorageRegistry {
    backends: DashMap<StorageId, Arc<dyn StorageBackend>>,
}

impl StorageRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, storage_id: StorageId, backend: Arc<dyn StorageBackend>) {
        tracing::info!("Registered storage backend: {}", storage_id);
        self.backends.insert(storage_id, backend);
    }

    pub fn get(&self, storage_id: &StorageId) -> StorageResult<Arc<dyn StorageBackend>> {
        self.backends
            .get(storage_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::UnknownStorage(storage_id.clone()))
    }

    pub fn storage_ids(&self) -> Vec<StorageId> {
        let mut ids: Vec<StorageId> = self.backends.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
