// ABOUTME: Bounded in-memory log retention for the supervisor and its workers
// ABOUTME: LogSink is the single append contract fed by stdout/stderr capture

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Source tag for entries produced by the supervisor itself
pub const SUPERVISOR_SOURCE: &str = "supervisor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            source: source.into(),
            message: message.into(),
        }
    }

    /// Mirror the entry into tracing.
    pub fn emit(&self) {
        let source = self.source.as_str();
        let message = self.message.as_str();
        match self.level {
            LogLevel::Debug => tracing::debug!(source = %source, "{}", message),
            LogLevel::Info => tracing::info!(source = %source, "{}", message),
            LogLevel::Warn => tracing::warn!(source = %source, "{}", message),
            LogLevel::Error => tracing::error!(source = %source, "{}", message),
        }
    }
}

/// Anything that accepts captured process output.
pub trait LogSink: Send + Sync {
    fn append_log(&self, worker: &str, level: LogLevel, line: &str);
}

/// Append-only ring of log entries; oldest entries are evicted at capacity.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Push an entry and mirror it into tracing.
    pub fn record(&self, level: LogLevel, source: &str, message: impl Into<String>) {
        let entry = LogEntry::new(level, source, message);
        entry.emit();
        self.push(entry);
    }

    /// Last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let entries = self.lock();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl LogSink for LogBuffer {
    fn append_log(&self, worker: &str, level: LogLevel, line: &str) {
        self.push(LogEntry::new(level, worker, line));
    }
}

/// Fixed-capacity ring of plain lines, used for per-worker output tails.
#[derive(Debug, Clone)]
pub struct LineRing {
    capacity: usize,
    lines: VecDeque<String>,
}

impl LineRing {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

impl Default for LineRing {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
