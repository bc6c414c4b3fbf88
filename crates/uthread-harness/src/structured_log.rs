//! Structured JSONL logs: the runtime's record types plus validation of
//! log files it wrote.

use std::collections::HashSet;
use std::io;
use std::path::Path;

pub use uthread_rt::log::{LogEmitter, LogEntry, LogLevel};

/// Checks one log line and returns the parsed entry.
pub fn validate_line(line: &str) -> Result<LogEntry, String> {
    let entry: LogEntry = serde_json::from_str(line).map_err(|err| format!("invalid entry: {err}"))?;
    let mut missing = Vec::new();
    if entry.timestamp.is_empty() {
        missing.push("timestamp");
    }
    if entry.trace_id.is_empty() {
        missing.push("trace_id");
    }
    if entry.event.is_empty() {
        missing.push("event");
    }
    if !missing.is_empty() {
        return Err(format!("empty fields: {}", missing.join(", ")));
    }
    if !entry.trace_id.contains("::") {
        return Err(format!("trace_id '{}' has no run prefix", entry.trace_id));
    }
    if !entry
        .event
        .chars()
        .all(|c| c.is_ascii_lowercase() || c == '.' || c == '_')
    {
        return Err(format!("event '{}' is not a dotted lowercase name", entry.event));
    }
    if let Some(errno) = entry.errno
        && errno <= 0
    {
        return Err(format!("errno {errno} is not a positive error number"));
    }
    Ok(entry)
}

/// Validates every line of a JSONL log.
///
/// Returns the number of non-empty lines and one message per problem found,
/// prefixed with its 1-based line number.
pub fn validate_log_file(path: &Path) -> io::Result<(usize, Vec<String>)> {
    let content = std::fs::read_to_string(path)?;
    Ok(validate_log_str(&content))
}

#[must_use]
pub fn validate_log_str(content: &str) -> (usize, Vec<String>) {
    let mut count = 0;
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        count += 1;
        match validate_line(line) {
            Ok(entry) => {
                if !seen.insert(entry.trace_id.clone()) {
                    errors.push(format!("line {}: duplicate trace_id '{}'", idx + 1, entry.trace_id));
                }
            }
            Err(err) => errors.push(format!("line {}: {err}", idx + 1)),
        }
    }
    (count, errors)
}
