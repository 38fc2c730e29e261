//! Log entries and sinks for tracked operations.
//!
//! Every intercepted operation produces one or more [`LogEntry`] records. The
//! tracker keeps the ordered sequence in memory and hands each entry to its
//! configured [`LogSink`]s as it is appended.
//!
//! # Levels
//!
//! - [`LogLevel::Action`] - an operation was performed and accounted for
//! - [`LogLevel::Info`] - configuration and flow-rate changes
//! - [`LogLevel::Error`] - an anomaly; the entry carries its [`AnomalyKind`]
//!
//! # Example
//!
//! ```
//! use welltrace_core::log::{LogEntry, LogLevel};
//!
//! let entry = LogEntry::new(LogLevel::Action, "Picked up a new p300 tip.");
//! assert!(!entry.is_error());
//! assert_eq!(entry.to_string(), "[ACTION] Picked up a new p300 tip.");
//! ```

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AnomalyKind, TrackingError};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Action,
    Info,
    Error,
}

impl LogLevel {
    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Action => "[ACTION]",
            LogLevel::Info => "[INFO]",
            LogLevel::Error => "[ERROR]",
        }
    }

    /// ANSI-colored tag: green, cyan, red.
    pub fn colored_tag(&self) -> &'static str {
        match self {
            LogLevel::Action => "\x1b[32m[ACTION]\x1b[0m",
            LogLevel::Info => "\x1b[36m[INFO]\x1b[0m",
            LogLevel::Error => "\x1b[31m[ERROR]\x1b[0m",
        }
    }
}

/// One record in the tracking log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unique identifier for this entry.
    pub id: Uuid,

    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,

    pub level: LogLevel,

    pub message: String,

    /// Set on ERROR entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<AnomalyKind>,
}

impl LogEntry {
    /// Creates an entry with a fresh id and the current time.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
            anomaly: None,
        }
    }

    /// Creates an ERROR entry describing a tracking anomaly.
    pub fn anomaly(error: &TrackingError) -> Self {
        Self {
            anomaly: Some(error.kind()),
            ..Self::new(LogLevel::Error, error.to_string())
        }
    }

    pub fn is_error(&self) -> bool {
        self.level == LogLevel::Error
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.level.tag(), self.message)
    }
}

/// Receives each log entry as it is appended.
///
/// Sinks run synchronously on the calling thread, in append order. An
/// implementation may block (for example to wait for an operator) but the
/// sinks shipped with this crate never do.
pub trait LogSink: Send + Sync {
    fn emit(&self, entry: &LogEntry);
}

impl<S: LogSink + ?Sized> LogSink for Arc<S> {
    fn emit(&self, entry: &LogEntry) {
        (**self).emit(entry);
    }
}

/// Prints entries to stdout as `[LEVEL] message`.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleSink {
    color: bool,
}

impl ConsoleSink {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    pub fn format(&self, entry: &LogEntry) -> String {
        let tag = if self.color {
            entry.level.colored_tag()
        } else {
            entry.level.tag()
        };
        format!("{} {}", tag, entry.message)
    }
}

impl LogSink for ConsoleSink {
    fn emit(&self, entry: &LogEntry) {
        println!("{}", self.format(entry));
    }
}

/// Appends entries to a JSON Lines file, one object per line.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for JsonlSink {
    fn emit(&self, entry: &LogEntry) {
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match serde_json::to_string(entry) {
            Ok(json) => {
                if let Err(e) = writeln!(writer, "{}", json).and_then(|_| writer.flush()) {
                    tracing::warn!(path = %self.path.display(), error = %e, "failed to write audit entry");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize audit entry"),
        }
    }
}

impl fmt::Debug for JsonlSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlSink")
            .field("path", &self.path)
            .field("writer", &"<Mutex<BufWriter<File>>>")
            .finish()
    }
}

/// Collects entries in memory. Useful for hosts that render the log
/// themselves.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl LogSink for MemorySink {
    fn emit(&self, entry: &LogEntry) {
        match self.entries.lock() {
            Ok(mut guard) => guard.push(entry.clone()),
            Err(poisoned) => poisoned.into_inner().push(entry.clone()),
        }
    }
}
