use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a physical storage backend (e.g. `"local"`, `"s3-archive"`).
///
/// Appears verbatim in the op encoding and in the done log, so it must not
/// contain `:`, `;`, `=` or `,`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub String);

impl StorageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata of a single path as reported by a backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathInfo {
    pub path: String,
    pub is_dir: bool,
    pub length: u64,
    /// Modification time in milliseconds since the epoch.
    pub mtime: u64,
}

/// Returns the parent directory of a `/`-separated path, if any.
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}
