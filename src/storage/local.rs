//! Local filesystem backend rooted at a directory.

use super::backend::{StorageBackend, StorageError, StorageResult};
use super::types::PathInfo;

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn info(&self, path: &str, meta: &fs::Metadata) -> PathInfo {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        PathInfo {
            path: path.to_string(),
            is_dir: meta.is_dir(),
            length: if meta.is_dir() { 0 } else { meta.len() },
            mtime,
        }
    }
}

impl StorageBackend for LocalFileStorage {
    fn exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.resolve(path).exists())
    }

    fn path_info(&self, path: &str) -> StorageResult<PathInfo> {
        let meta = fs::metadata(self.resolve(path)).map_err(|e| StorageError::io(path, e))?;
        Ok(self.info(path, &meta))
    }

    fn list(&self, path: &str) -> StorageResult<Vec<PathInfo>> {
        let dir = path.trim_end_matches('/');
        let mut children = Vec::new();
        for entry in fs::read_dir(self.resolve(path)).map_err(|e| StorageError::io(path, e))? {
            let entry = entry.map_err(|e| StorageError::io(path, e))?;
            let meta = entry.metadata().map_err(|e| StorageError::io(path, e))?;
            let child = format!("{}/{}", dir, entry.file_name().to_string_lossy());
            children.push(self.info(&child, &meta));
        }
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    fn mkdirs(&self, path: &str) -> StorageResult<()> {
        fs::create_dir_all(self.resolve(path)).map_err(|e| StorageError::io(path, e))
    }

    fn delete_file(&self, path: &str) -> StorageResult<()> {
        fs::remove_file(self.resolve(path)).map_err(|e| StorageError::io(path, e))
    }

    fn rename_file(&self, old_path: &str, new_path: &str) -> StorageResult<()> {
        fs::rename(self.resolve(old_path), self.resolve(new_path))
            .map_err(|e| StorageError::io(old_path, e))
    }

    fn open_read(&self, path: &str, offset: u64) -> StorageResult<Box<dyn Read + Send>> {
        let mut file = File::open(self.resolve(path)).map_err(|e| StorageError::io(path, e))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| StorageError::io(path, e))?;
        }
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &str, append: bool) -> StorageResult<Box<dyn Write + Send>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(self.resolve(path))
            .map_err(|e| StorageError::io(path, e))?;
        Ok(Box::new(BufWriter::new(file)))
    }
}
