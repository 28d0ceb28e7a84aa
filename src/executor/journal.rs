//! Append-only completion log.
//!
//! One line per terminal outcome:
//!
//! ```text
//! <status>:<taskId>:<startTime>:<elapsedMillis>:<warnings>:<sid>=<elapsed>,<read>,<write>,<calls>,<metaRead>,<metaWrite>;...
//! ```
//!
//! `status` is `-` (ok) or `W` (ok with warnings) in the done log. The error log
//! uses `E` and appends the error message as a last field, which may itself
//! contain `:`. Warnings are comma-joined, so `:`, `,` and `;` inside a warning
//! are replaced by spaces before writing.

use super::queue::QueueObserver;
use crate::iocost::{IoCost, PerStorageCost};
use crate::ops::{ExecutionResult, Operation, TaskId, now_ms};
use crate::storage::StorageId;

use parking_lot::Mutex;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Ok,
    Warning,
    Error,
}

impl LogStatus {
    fn as_char(self) -> char {
        match self {
            LogStatus::Ok => '-',
            LogStatus::Warning => 'W',
            LogStatus::Error => 'E',
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "-" => Some(LogStatus::Ok),
            "W" => Some(LogStatus::Warning),
            "E" => Some(LogStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub status: LogStatus,
    pub task_id: TaskId,
    pub start_time: u64,
    pub elapsed_millis: u64,
    pub warnings: Vec<String>,
    pub cost: PerStorageCost,
    pub error_message: Option<String>,
}

/// Parsed records plus `(line number, reason)` for every line that was skipped.
#[derive(Debug, Default)]
pub struct LogReport {
    pub records: Vec<LogRecord>,
    pub malformed: Vec<(usize, String)>,
}

fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            ':' | ',' | ';' | '\n' | '\r' => ' ',
            _ => c,
        })
        .collect()
}

fn format_cost(cost: &PerStorageCost) -> String {
    cost.iter()
        .map(|(storage_id, c)| {
            format!(
                "{}={},{},{},{},{},{}",
                storage_id,
                c.elapsed_millis,
                c.io_read_len,
                c.io_write_len,
                c.call_count,
                c.metadata_read_count,
                c.metadata_write_count
            )
        })
        .collect::<Vec<_>>()
        .join(";")
}

fn parse_cost(raw: &str) -> Result<PerStorageCost, String> {
    let mut cost = PerStorageCost::new();
    for item in raw.split(';').filter(|item| !item.is_empty()) {
        let (storage_id, counters) = item
            .split_once('=')
            .ok_or_else(|| format!("cost entry without '=': {}", item))?;
        let values = counters
            .split(',')
            .map(|v| v.parse::<u64>().map_err(|_| format!("bad cost counter '{}'", v)))
            .collect::<Result<Vec<_>, _>>()?;
        let &[elapsed_millis, io_read_len, io_write_len, call_count, metadata_read_count, metadata_write_count] =
            values.as_slice()
        else {
            return Err(format!("cost entry needs 6 counters: {}", item));
        };
        cost.add_for(
            &StorageId::new(storage_id),
            &IoCost {
                elapsed_millis,
                io_read_len,
                io_write_len,
                call_count,
                metadata_read_count,
                metadata_write_count,
            },
        );
    }
    Ok(cost)
}

/// Done-log line for a successful result, newline included.
pub fn format_done_line(result: &ExecutionResult) -> String {
    let status = if result.has_warnings() {
        LogStatus::Warning
    } else {
        LogStatus::Ok
    };
    let warnings: Vec<String> = result.warnings.iter().map(|w| sanitize(w)).collect();
    format!(
        "{}:{}:{}:{}:{}:{}\n",
        status.as_char(),
        result.task_id,
        result.start_time,
        result.elapsed_millis,
        warnings.join(","),
        format_cost(&result.measured_cost)
    )
}

/// Error-log line. The message goes last and only has newlines replaced.
pub fn format_error_line(
    task_id: TaskId,
    start_time: u64,
    elapsed_millis: u64,
    cost: &PerStorageCost,
    message: &str,
) -> String {
    format!(
        "E:{}:{}:{}:{}:{}\n",
        task_id,
        start_time,
        elapsed_millis,
        format_cost(cost),
        message.replace(['\n', '\r'], " ")
    )
}

pub fn parse_log_line(line: &str) -> Result<LogRecord, String> {
    let status_raw = line.split(':').next().unwrap_or_default();
    let status = LogStatus::parse(status_raw).ok_or_else(|| format!("unknown status '{}'", status_raw))?;
    // The error message is the unsplit remainder.
    let fields: Vec<&str> = line.splitn(6, ':').collect();
    if fields.len() != 6 {
        return Err(format!("expected 6 fields, found {}", fields.len()));
    }
    let number = |idx: usize| {
        fields[idx]
            .parse::<u64>()
            .map_err(|_| format!("field {} is not a number: {}", idx + 1, fields[idx]))
    };
    let task_id = TaskId(number(1)?);
    let start_time = number(2)?;
    let elapsed_millis = number(3)?;

    let (warnings, cost, error_message) = match status {
        LogStatus::Error => (Vec::new(), parse_cost(fields[4])?, Some(fields[5].to_string())),
        LogStatus::Ok | LogStatus::Warning => {
            if fields[5].contains(':') {
                return Err("too many fields".to_string());
            }
            let warnings = fields[4]
                .split(',')
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .collect();
            (warnings, parse_cost(fields[5])?, None)
        }
    };

    Ok(LogRecord {
        status,
        task_id,
        start_time,
        elapsed_millis,
        warnings,
        cost,
        error_message,
    })
}

/// Reads a whole log, skipping (and reporting) malformed lines.
pub fn read_log(text: &str) -> LogReport {
    let mut report = LogReport::default();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_log_line(line) {
            Ok(record) => report.records.push(record),
            Err(reason) => {
                tracing::warn!("Skipping malformed log line {}: {}", idx + 1, reason);
                report.malformed.push((idx + 1, reason));
            }
        }
    }
    report
}

struct JournalStreams {
    done: BufWriter<Box<dyn Write + Send>>,
    error: BufWriter<Box<dyn Write + Send>>,
    last_flush: Instant,
}

/// Queue observer writing completions to the done and error logs.
///
/// Lines are buffered and flushed once `flush_interval` has passed since the
/// previous flush, so a crash loses at most that window of records.
pub struct JournalWriter {
    streams: Mutex<JournalStreams>,
    flush_interval: Duration,
}

impl JournalWriter {
    pub fn new(
        done: Box<dyn Write + Send>,
        error: Box<dyn Write + Send>,
        flush_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(JournalStreams {
                done: BufWriter::new(done),
                error: BufWriter::new(error),
                last_flush: Instant::now(),
            }),
            flush_interval,
        })
    }

    fn append(&self, line: &str, to_error_log: bool) {
        let mut streams = self.streams.lock();
        let stream = if to_error_log {
            &mut streams.error
        } else {
            &mut streams.done
        };
        if let Err(e) = stream.write_all(line.as_bytes()) {
            tracing::error!("Failed to append completion record: {}", e);
            return;
        }
        if streams.last_flush.elapsed() >= self.flush_interval {
            if let Err(e) = Self::flush_streams(&mut streams) {
                tracing::error!("Failed to flush completion log: {}", e);
            }
        }
    }

    fn flush_streams(streams: &mut JournalStreams) -> std::io::Result<()> {
        streams.last_flush = Instant::now();
        streams.done.flush()?;
        streams.error.flush()
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        Self::flush_streams(&mut self.streams.lock())?;
        Ok(())
    }
}

impl QueueObserver for JournalWriter {
    fn on_op_executed_success(&self, _op: &Operation, result: &ExecutionResult) {
        self.append(&format_done_line(result), false);
    }

    fn on_op_executed_error(&self, _op: &Operation, result: &ExecutionResult) {
        let message = result.error_message.as_deref().unwrap_or_default();
        let line = format_error_line(
            result.task_id,
            result.start_time,
            result.elapsed_millis,
            &result.measured_cost,
            message,
        );
        self.append(&line, true);
    }

    fn on_op_unexpected_error(&self, op: &Operation, error: &str) {
        let line = format_error_line(op.task_id, now_ms(), 0, &PerStorageCost::new(), error);
        self.append(&line, true);
    }
}
