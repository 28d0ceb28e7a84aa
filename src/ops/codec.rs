//! Line-oriented text encoding of operation lists.
//!
//! One record per operation, fields separated by `:`. Paths are always quoted
//! (`"` and `\` escaped, newlines as `\n`), so they may contain the delimiter.
//!
//! ```text
//! 1:d:local:"/out/dir"
//! 2:f:local:"/out/a.bin":s3:"/in/a.bin":1024
//! 3:c:local:"/out/b.bin":s3:"/in/b.bin":2048
//! 4:z:local:"/out/pack.zip":s3:2:30
//! e:"a.txt":"/in/a.txt":10
//! e:"b.txt":"/in/b.txt":20
//! 5:s:250
//! ```
//!
//! A zip-copy header is followed by exactly `entryCount` entry lines.

use super::types::{JobId, OpKind, Operation, TaskId, ZipEntry};
use crate::storage::StorageId;

use std::iter::{Enumerate, Peekable};
use std::str::Lines;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct CodecError {
    pub line: usize,
    pub message: String,
}

impl CodecError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

// --- Encoding ---

pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Encodes one operation; zip-copies span several lines. Always ends with a newline.
pub fn encode_op(op: &Operation) -> String {
    let task_id = op.task_id;
    match &op.kind {
        OpKind::Mkdir { storage, path } => format!("{}:d:{}:{}\n", task_id, storage, quote(path)),
        OpKind::CopyFile { dest_storage, dest_path, src_storage, src_path, src_len } => format!(
            "{}:f:{}:{}:{}:{}:{}\n",
            task_id,
            dest_storage,
            quote(dest_path),
            src_storage,
            quote(src_path),
            src_len
        ),
        OpKind::CopyFileContent { dest_storage, dest_path, src_storage, src_path, src_len } => format!(
            "{}:c:{}:{}:{}:{}:{}\n",
            task_id,
            dest_storage,
            quote(dest_path),
            src_storage,
            quote(src_path),
            src_len
        ),
        OpKind::ZipCopyFile { dest_storage, dest_path, src_storage, entries } => {
            let total: u64 = entries.iter().map(|e| e.src_len).sum();
            let mut out = format!(
                "{}:z:{}:{}:{}:{}:{}\n",
                task_id,
                dest_storage,
                quote(dest_path),
                src_storage,
                entries.len(),
                total
            );
            for entry in entries {
                out.push_str(&format!(
                    "e:{}:{}:{}\n",
                    quote(&entry.dest_entry_path),
                    quote(&entry.src_path),
                    entry.src_len
                ));
            }
            out
        }
        OpKind::MockSleep { millis } => format!("{}:s:{}\n", task_id, millis),
    }
}

pub fn encode_ops<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> String {
    ops.into_iter().map(encode_op).collect()
}

// --- Decoding ---

#[derive(Debug, PartialEq, Eq)]
enum Field {
    Bare(String),
    Quoted(String),
}

fn split_fields(line: &str) -> Result<Vec<Field>, String> {
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('"') => value.push('"'),
                        Some('\\') => value.push('\\'),
                        Some('n') => value.push('\n'),
                        Some('r') => value.push('\r'),
                        Some(other) => return Err(format!("invalid escape \\{}", other)),
                        None => return Err("unterminated escape".to_string()),
                    },
                    Some(c) => value.push(c),
                    None => return Err("unterminated quoted field".to_string()),
                }
            }
            fields.push(Field::Quoted(value));
            match chars.next() {
                Some(':') => continue,
                None => break,
                Some(c) => return Err(format!("unexpected '{}' after quoted field", c)),
            }
        }
        let mut value = String::new();
        let mut ended = true;
        for c in chars.by_ref() {
            if c == ':' {
                ended = false;
                break;
            }
            value.push(c);
        }
        fields.push(Field::Bare(value));
        if ended {
            break;
        }
    }
    Ok(fields)
}

struct Fields {
    items: Vec<Field>,
}

impl Fields {
    fn expect_len(&self, len: usize, what: &str) -> Result<(), String> {
        if self.items.len() != len {
            return Err(format!(
                "{} record needs {} fields, found {}",
                what,
                len,
                self.items.len()
            ));
        }
        Ok(())
    }

    fn bare(&self, idx: usize) -> Result<&str, String> {
        match &self.items[idx] {
            Field::Bare(value) if !value.is_empty() => Ok(value),
            Field::Bare(_) => Err(format!("field {} is empty", idx + 1)),
            Field::Quoted(_) => Err(format!("field {} must not be quoted", idx + 1)),
        }
    }

    fn quoted(&self, idx: usize) -> Result<String, String> {
        match &self.items[idx] {
            Field::Quoted(value) => Ok(value.clone()),
            Field::Bare(_) => Err(format!("field {} must be a quoted path", idx + 1)),
        }
    }

    fn number(&self, idx: usize) -> Result<u64, String> {
        let raw = self.bare(idx)?;
        raw.parse::<u64>()
            .map_err(|_| format!("field {} is not a non-negative integer: {}", idx + 1, raw))
    }

    fn storage(&self, idx: usize) -> Result<StorageId, String> {
        self.bare(idx).map(StorageId::new)
    }
}

fn is_entry_line(line: &str) -> bool {
    line.starts_with("e:")
}

/// Streams operations out of an encoded list, one `Result` per record.
///
/// A malformed record yields an error and decoding resumes at the next record
/// boundary (entry lines of a broken zip-copy are skipped with it).
pub struct OpsReader<'a> {
    lines: Peekable<Enumerate<Lines<'a>>>,
    job_id: JobId,
}

impl<'a> OpsReader<'a> {
    pub fn new(text: &'a str, job_id: JobId) -> Self {
        Self {
            lines: text.lines().enumerate().peekable(),
            job_id,
        }
    }

    fn skip_entry_lines(&mut self) {
        while self
            .lines
            .peek()
            .is_some_and(|(_, line)| is_entry_line(line))
        {
            self.lines.next();
        }
    }

    fn decode_record(&mut self, line_no: usize, line: &str) -> Result<Operation, CodecError> {
        if is_entry_line(line) {
            return Err(CodecError::new(line_no, "zip entry line without a zip-copy header"));
        }
        let fields = Fields {
            items: split_fields(line).map_err(|m| CodecError::new(line_no, m))?,
        };
        if fields.items.len() < 2 {
            return Err(CodecError::new(line_no, "record needs a task id and a kind"));
        }
        let task_id = TaskId(fields.number(0).map_err(|m| CodecError::new(line_no, m))?);
        let kind = fields.bare(1).map_err(|m| CodecError::new(line_no, m))?.to_string();

        let op_kind = match kind.as_str() {
            "d" => Self::decode_mkdir(&fields),
            "f" => Self::decode_copy(&fields).map(|(dest_storage, dest_path, src_storage, src_path, src_len)| {
                OpKind::CopyFile { dest_storage, dest_path, src_storage, src_path, src_len }
            }),
            "c" => Self::decode_copy(&fields).map(|(dest_storage, dest_path, src_storage, src_path, src_len)| {
                OpKind::CopyFileContent { dest_storage, dest_path, src_storage, src_path, src_len }
            }),
            "s" => fields
                .expect_len(3, "sleep")
                .and_then(|_| fields.number(2))
                .map(|millis| OpKind::MockSleep { millis }),
            "z" => return self.decode_zip(line_no, task_id, &fields),
            other => Err(format!("unknown operation kind '{}'", other)),
        }
        .map_err(|m| CodecError::new(line_no, m))?;

        Ok(Operation::new(self.job_id.clone(), task_id, op_kind))
    }

    fn decode_mkdir(fields: &Fields) -> Result<OpKind, String> {
        fields.expect_len(4, "mkdir")?;
        Ok(OpKind::Mkdir {
            storage: fields.storage(2)?,
            path: fields.quoted(3)?,
        })
    }

    fn decode_copy(fields: &Fields) -> Result<(StorageId, String, StorageId, String, u64), String> {
        fields.expect_len(7, "copy")?;
        Ok((
            fields.storage(2)?,
            fields.quoted(3)?,
            fields.storage(4)?,
            fields.quoted(5)?,
            fields.number(6)?,
        ))
    }

    fn decode_zip(&mut self, line_no: usize, task_id: TaskId, fields: &Fields) -> Result<Operation, CodecError> {
        let header = fields.expect_len(7, "zip-copy").and_then(|_| {
            Ok((
                fields.storage(2)?,
                fields.quoted(3)?,
                fields.storage(4)?,
                fields.number(5)?,
                fields.number(6)?,
            ))
        });
        let (dest_storage, dest_path, src_storage, entry_count, total_size) = match header {
            Ok(header) => header,
            Err(m) => {
                self.skip_entry_lines();
                return Err(CodecError::new(line_no, m));
            }
        };

        let mut entries = Vec::new();
        for _ in 0..entry_count {
            let entry = match self.lines.peek() {
                Some((idx, line)) if is_entry_line(line) => {
                    let entry_line_no = idx + 1;
                    let parsed = Self::decode_entry(line).map_err(|m| CodecError::new(entry_line_no, m));
                    self.lines.next();
                    parsed
                }
                _ => Err(CodecError::new(
                    line_no,
                    format!("zip-copy declares {} entries, found {}", entry_count, entries.len()),
                )),
            };
            match entry {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    self.skip_entry_lines();
                    return Err(e);
                }
            }
        }
        if self.lines.peek().is_some_and(|(_, line)| is_entry_line(line)) {
            self.skip_entry_lines();
            return Err(CodecError::new(
                line_no,
                format!("zip-copy declares {} entries but more follow", entry_count),
            ));
        }

        let actual_total: u64 = entries.iter().map(|e| e.src_len).sum();
        if actual_total != total_size {
            return Err(CodecError::new(
                line_no,
                format!("zip-copy total size {} does not match entries ({})", total_size, actual_total),
            ));
        }

        Ok(Operation::new(
            self.job_id.clone(),
            task_id,
            OpKind::ZipCopyFile { dest_storage, dest_path, src_storage, entries },
        ))
    }

    fn decode_entry(line: &str) -> Result<ZipEntry, String> {
        let fields = Fields { items: split_fields(line)? };
        fields.expect_len(4, "zip entry")?;
        Ok(ZipEntry {
            dest_entry_path: fields.quoted(1)?,
            src_path: fields.quoted(2)?,
            src_len: fields.number(3)?,
        })
    }
}

impl Iterator for OpsReader<'_> {
    type Item = Result<Operation, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (idx, line) = self.lines.next()?;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            return Some(self.decode_record(idx + 1, line));
        }
    }
}

/// Strict decode: the first malformed record aborts.
pub fn decode_ops(text: &str, job_id: &JobId) -> Result<Vec<Operation>, CodecError> {
    OpsReader::new(text, job_id.clone()).collect()
}
