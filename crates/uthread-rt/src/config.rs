//! Runtime configuration.
//!
//! Defaults suit tests and small programs; every field can be overridden
//! from `UTHREAD_*` environment variables. Unparseable values keep the
//! default.

use std::path::PathBuf;
use std::time::Duration;

use uthread_core::SchedConfig;

use crate::log::LogLevel;

/// Where log records go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Off,
    Stderr,
    File(PathBuf),
}

/// How much checking the runtime does on its own state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Strict,
    /// Runs the full scheduler invariant check after every dispatch.
    Hardened,
}

impl Mode {
    #[must_use]
    pub fn parse(raw: &str) -> Mode {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hardened" | "full" | "debug" => Mode::Hardened,
            _ => Mode::Strict,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Mode::Strict => "strict",
            Mode::Hardened => "hardened",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub mode: Mode,
    pub quantum: Duration,
    /// Stack size for threads whose attribute does not name one.
    pub stack_size: usize,
    pub fd_table_size: usize,
    pub max_threads: usize,
    pub log: LogTarget,
    pub log_level: LogLevel,
    /// Re-check interval for `wait_child` when no SIGCHLD intake is
    /// installed.
    pub child_recheck: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let sched = SchedConfig::default();
        Self {
            mode: Mode::Strict,
            quantum: sched.quantum,
            stack_size: 256 * 1024,
            fd_table_size: sched.fd_table_size,
            max_threads: sched.max_threads,
            log: LogTarget::Off,
            log_level: LogLevel::Info,
            child_recheck: Duration::from_millis(50),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    #[must_use]
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup("UTHREAD_MODE") {
            self.mode = Mode::parse(&raw);
        }
        if let Some(ms) = lookup("UTHREAD_QUANTUM_MS").and_then(|v| v.trim().parse::<u64>().ok())
            && ms > 0
        {
            self.quantum = Duration::from_millis(ms);
        }
        if let Some(size) = lookup("UTHREAD_STACK_SIZE").and_then(|v| v.trim().parse::<usize>().ok())
            && size >= 16 * 1024
        {
            self.stack_size = size;
        }
        if let Some(size) =
            lookup("UTHREAD_FD_TABLE_SIZE").and_then(|v| v.trim().parse::<usize>().ok())
            && size > 0
        {
            self.fd_table_size = size;
        }
        if let Some(raw) = lookup("UTHREAD_LOG") {
            self.log = match raw.trim() {
                "" | "off" | "0" => LogTarget::Off,
                "stderr" | "-" => LogTarget::Stderr,
                path => LogTarget::File(PathBuf::from(path)),
            };
        }
        if let Some(level) = lookup("UTHREAD_LOG_LEVEL").and_then(|v| LogLevel::parse(&v)) {
            self.log_level = level;
        }
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_log(mut self, target: LogTarget, level: LogLevel) -> Self {
        self.log = target;
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn with_quantum(mut self, quantum: Duration) -> Self {
        self.quantum = quantum;
        self
    }

    pub(crate) fn sched_config(&self) -> SchedConfig {
        SchedConfig {
            quantum: self.quantum,
            max_threads: self.max_threads,
            fd_table_size: self.fd_table_size,
            external_signals: false,
        }
    }
}
