//! In-memory storage backend.
//!
//! A `DashMap`-backed file tree used by tests and dry runs. Writers buffer
//! locally and publish their bytes on `flush` (and on drop), so a reader
//! observes only flushed data, like a real append-only log file.

use super::backend::{StorageBackend, StorageError, StorageResult};
use super::types::{PathInfo, parent_path};

use dashmap::DashMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
enum MemEntry {
    Dir { mtime: u64 },
    File { data: Vec<u8>, mtime: u64 },
}

pub struct InMemoryStorage {
    entries: Arc<DashMap<String, MemEntry>>,
    /// Number of upcoming calls that fail with a transient backend error.
    injected_failures: AtomicU32,
}

impl InMemoryStorage {
    pub fn new() -> Arc<Self> {
        let entries = DashMap::new();
        entries.insert("/".to_string(), MemEntry::Dir { mtime: now_ms() });
        Arc::new(Self {
            entries: Arc::new(entries),
            injected_failures: AtomicU32::new(0),
        })
    }

    /// Makes the next `count` backend calls fail with a retryable error.
    pub fn inject_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value(), MemEntry::File { .. }))
            .count()
    }

    fn check_injected_failure(&self, path: &str) -> StorageResult<()> {
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StorageError::Backend(format!("injected failure on {}", path))),
            Err(_) => Ok(()),
        }
    }

    fn info_of(path: &str, entry: &MemEntry) -> PathInfo {
        match entry {
            MemEntry::Dir { mtime } => PathInfo {
                path: path.to_string(),
                is_dir: true,
                length: 0,
                mtime: *mtime,
            },
            MemEntry::File { data, mtime } => PathInfo {
                path: path.to_string(),
                is_dir: false,
                length: data.len() as u64,
                mtime: *mtime,
            },
        }
    }
}

impl StorageBackend for InMemoryStorage {
    fn exists(&self, path: &str) -> StorageResult<bool> {
        self.check_injected_failure(path)?;
        Ok(self.entries.contains_key(&normalize(path)))
    }

    fn path_info(&self, path: &str) -> StorageResult<PathInfo> {
        self.check_injected_failure(path)?;
        let path = normalize(path);
        self.entries
            .get(&path)
            .map(|entry| Self::info_of(&path, entry.value()))
            .ok_or(StorageError::NotFound(path))
    }

    fn list(&self, path: &str) -> StorageResult<Vec<PathInfo>> {
        self.check_injected_failure(path)?;
        let dir = normalize(path);
        if !matches!(self.entries.get(&dir).as_deref(), Some(MemEntry::Dir { .. })) {
            return Err(StorageError::NotFound(dir));
        }
        let mut children: Vec<PathInfo> = self
            .entries
            .iter()
            .filter(|entry| entry.key() != &dir && parent_path(entry.key()) == Some(dir.as_str()))
            .map(|entry| Self::info_of(entry.key(), entry.value()))
            .collect();
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    fn mkdirs(&self, path: &str) -> StorageResult<()> {
        self.check_injected_failure(path)?;
        let mut current = Some(normalize(path));
        while let Some(dir) = current {
            if let Some(MemEntry::File { .. }) = self.entries.get(&dir).as_deref() {
                return Err(StorageError::Backend(format!("{} is a file", dir)));
            }
            current = parent_path(&dir).map(str::to_string);
            self.entries
                .entry(dir)
                .or_insert_with(|| MemEntry::Dir { mtime: now_ms() });
        }
        Ok(())
    }

    fn delete_file(&self, path: &str) -> StorageResult<()> {
        self.check_injected_failure(path)?;
        let path = normalize(path);
        match self.entries.remove(&path) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(path)),
        }
    }

    fn rename_file(&self, old_path: &str, new_path: &str) -> StorageResult<()> {
        self.check_injected_failure(old_path)?;
        let old_path = normalize(old_path);
        let (_, entry) = self
            .entries
            .remove(&old_path)
            .ok_or(StorageError::NotFound(old_path))?;
        self.entries.insert(normalize(new_path), entry);
        Ok(())
    }

    fn open_read(&self, path: &str, offset: u64) -> StorageResult<Box<dyn Read + Send>> {
        self.check_injected_failure(path)?;
        let path = normalize(path);
        match self.entries.get(&path).as_deref() {
            Some(MemEntry::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                Ok(Box::new(Cursor::new(data[start..].to_vec())))
            }
            Some(MemEntry::Dir { .. }) => {
                Err(StorageError::Backend(format!("{} is a directory", path)))
            }
            None => Err(StorageError::NotFound(path)),
        }
    }

    fn open_write(&self, path: &str, append: bool) -> StorageResult<Box<dyn Write + Send>> {
        self.check_injected_failure(path)?;
        let path = normalize(path);
        if let Some(MemEntry::Dir { .. }) = self.entries.get(&path).as_deref() {
            return Err(StorageError::Backend(format!("{} is a directory", path)));
        }
        if !append || !self.entries.contains_key(&path) {
            self.entries.insert(
                path.clone(),
                MemEntry::File {
                    data: Vec::new(),
                    mtime: now_ms(),
                },
            );
        }
        Ok(Box::new(MemWriter {
            entries: self.entries.clone(),
            path,
            pending: Vec::new(),
        }))
    }
}

struct MemWriter {
    entries: Arc<DashMap<String, MemEntry>>,
    path: String,
    pending: Vec<u8>,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut entry = self
            .entries
            .entry(self.path.clone())
            .or_insert_with(|| MemEntry::File {
                data: Vec::new(),
                mtime: now_ms(),
            });
        match entry.value_mut() {
            MemEntry::File { data, mtime } => {
                data.append(&mut self.pending);
                *mtime = now_ms();
                Ok(())
            }
            MemEntry::Dir { .. } => Err(std::io::Error::other(format!(
                "{} became a directory",
                self.path
            ))),
        }
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
