//! Host log forwarding.
//!
//! The engine logs through `tracing`; a host that wants those records in its
//! own pipeline (journald, a log shipper, an admin console) implements
//! [`LoggerSink`] and hands it to the runtime's logging setup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lower-case name, also valid as an `EnvFilter` directive.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(BridgeError::InvalidData(format!("unknown log level '{}'", other))),
        }
    }
}

/// One forwarded log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    /// Module path of the emitting code, e.g. `core_sync::batch`
    pub target: String,
    pub message: String,
    /// Structured fields, sorted by name
    pub fields: BTreeMap<String, String>,
    /// Innermost span the record was emitted in
    pub span: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            target: target.into(),
            message: message.into(),
            fields: BTreeMap::new(),
            span: None,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn in_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// The job run this record belongs to, when it was logged with a
    /// `job_id` field.
    pub fn job_id(&self) -> Option<&str> {
        self.field("job_id")
    }
}

/// Receives log records forwarded from the engine.
///
/// Sinks must not persist connection secrets. API keys and tokens are
/// redacted before they are logged, but a sink should not rely on it.
#[async_trait]
pub trait LoggerSink: Send + Sync {
    async fn log(&self, entry: LogEntry) -> Result<()>;

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Records below this level are dropped before reaching the sink.
    fn min_level(&self) -> LogLevel {
        LogLevel::Info
    }
}

/// Keeps the most recent records in memory, oldest evicted first.
///
/// The runtime installs one through `LoggingConfig::with_recent_logs` for
/// hosts that want the tail of a job's log without a pipeline of their own.
#[derive(Debug)]
pub struct RecentLogs {
    capacity: usize,
    min_level: LogLevel,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl RecentLogs {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            min_level: LogLevel::Info,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Snapshot, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records tagged with the given job run id, oldest first.
    pub fn for_job(&self, job_id: &str) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.job_id() == Some(job_id))
            .collect()
    }
}

#[async_trait]
impl LoggerSink for RecentLogs {
    async fn log(&self, entry: LogEntry) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| BridgeError::OperationFailed("log buffer poisoned".to_string()))?;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    fn min_level(&self) -> LogLevel {
        self.min_level
    }
}
