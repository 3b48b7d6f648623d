//! Bounded status log shown to the operator.
//!
//! Newest entries sit at the front; once the log is full the oldest entry is
//! dropped. Every line is mirrored to `tracing`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LogLevel {
    /// Normal progress.
    #[default]
    Info,
    /// Something was dropped or failed without ending the attempt.
    Warn,
    /// The attempt failed.
    Error,
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogEntry {
    /// When the line was appended.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// The text shown to the operator.
    pub message: String,
}

impl std::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Append-only ring buffer of status lines.
pub struct EventLog {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
    tx: broadcast::Sender<LogEntry>,
}

impl EventLog {
    /// Create a log holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(64);
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            tx,
        }
    }

    /// Append an entry.
    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };

        match level {
            LogLevel::Info => info!(target: "ble_fall_gateway::event_log", "{}", entry.message),
            LogLevel::Warn => warn!(target: "ble_fall_gateway::event_log", "{}", entry.message),
            LogLevel::Error => error!(target: "ble_fall_gateway::event_log", "{}", entry.message),
        }

        {
            let mut entries = self.entries.write();
            entries.push_front(entry.clone());
            entries.truncate(self.capacity);
        }

        let _ = self.tx.send(entry);
    }

    /// Append an informational line.
    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    /// Append a warning line.
    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message);
    }

    /// Append an error line.
    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    /// Snapshot of the log, newest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// The messages only, newest first.
    pub fn messages(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Check if any retained line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .read()
            .iter()
            .any(|e| e.message.contains(needle))
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Receive entries as they are appended.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(crate::config::GatewayOptions::DEFAULT_LOG_CAPACITY)
    }
}
