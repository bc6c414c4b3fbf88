//! Structured JSONL logging.
//!
//! One JSON object per line. Entries with an empty `trace_id` get one
//! assigned by the emitter as `<run_id>::<sequence>`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uthread_core::{Errno, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub fn parse(raw: &str) -> Option<LogLevel> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

fn now_timestamp() -> String {
    let since = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06}", since.as_secs(), since.subsec_micros())
}

impl LogEntry {
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_timestamp(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            thread: None,
            errno: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_thread(mut self, id: ThreadId) -> Self {
        self.thread = Some(id.to_string());
        self
    }

    #[must_use]
    pub fn with_errno(mut self, errno: Errno) -> Self {
        self.errno = Some(errno.raw());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

pub struct LogEmitter {
    out: Box<dyn Write + Send>,
    run_id: String,
    min_level: LogLevel,
    seq: u64,
}

impl std::fmt::Debug for LogEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEmitter")
            .field("run_id", &self.run_id)
            .field("min_level", &self.min_level)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl LogEmitter {
    /// Appends to `path`, creating it if needed.
    pub fn to_file(path: &Path, run_id: &str, min_level: LogLevel) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::to_writer(Box::new(BufWriter::new(file)), run_id, min_level))
    }

    #[must_use]
    pub fn to_stderr(run_id: &str, min_level: LogLevel) -> Self {
        Self::to_writer(Box::new(io::stderr()), run_id, min_level)
    }

    #[must_use]
    pub fn to_writer(out: Box<dyn Write + Send>, run_id: &str, min_level: LogLevel) -> Self {
        Self {
            out,
            run_id: run_id.to_string(),
            min_level,
            seq: 0,
        }
    }

    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    pub fn emit_entry(&mut self, mut entry: LogEntry) -> io::Result<()> {
        if !self.enabled(entry.level) {
            return Ok(());
        }
        self.seq += 1;
        if entry.trace_id.is_empty() {
            entry.trace_id = format!("{}::{:06}", self.run_id, self.seq);
        }
        let line = serde_json::to_string(&entry).map_err(io::Error::other)?;
        writeln!(self.out, "{line}")?;
        if entry.level >= LogLevel::Warn {
            self.out.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

impl Drop for LogEmitter {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}
