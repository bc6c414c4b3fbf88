//! Reports over scenario runs and runtime logs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::scenarios::ScenarioResult;
use crate::structured_log::validate_line;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<ScenarioResult>,
}

impl RunSummary {
    #[must_use]
    pub fn from_results(results: Vec<ScenarioResult>) -> Self {
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            results,
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// A scenario run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub title: String,
    /// Runtime modes exercised (strict, hardened or both).
    pub mode: String,
    /// Seconds since the Unix epoch when the report was made.
    pub timestamp: String,
    pub summary: RunSummary,
}

impl RunReport {
    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Mode: {}\n", self.mode));
        out.push_str(&format!("- Timestamp: {}\n", self.timestamp));
        out.push_str(&format!("- Total: {}\n", self.summary.total));
        out.push_str(&format!("- Passed: {}\n", self.summary.passed));
        out.push_str(&format!("- Failed: {}\n\n", self.summary.failed));

        out.push_str("| Scenario | Mode | Expected | Actual | Time (us) | Status |\n");
        out.push_str("|----------|------|----------|--------|-----------|--------|\n");
        for r in &self.summary.results {
            let status = match (&r.error, r.passed) {
                (_, true) => "PASS".to_string(),
                (Some(err), false) => format!("FAIL ({err})"),
                (None, false) => "FAIL".to_string(),
            };
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} |\n",
                r.name,
                r.mode,
                r.expected.join(" "),
                r.actual.join(" "),
                r.elapsed_us,
                status
            ));
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

/// Event counts over a JSONL runtime log.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogSummary {
    pub total_events: usize,
    pub invalid_lines: usize,
    pub runs: usize,
    pub by_level: BTreeMap<String, usize>,
    pub by_event: BTreeMap<String, usize>,
}

impl LogSummary {
    #[must_use]
    pub fn from_jsonl_str(jsonl: &str) -> Self {
        let mut summary = Self::default();
        for raw in jsonl.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            summary.total_events += 1;
            let Ok(entry) = validate_line(line) else {
                summary.invalid_lines += 1;
                continue;
            };
            if entry.event == "runtime.start" {
                summary.runs += 1;
            }
            *summary
                .by_level
                .entry(entry.level.as_str().to_string())
                .or_default() += 1;
            *summary.by_event.entry(entry.event).or_default() += 1;
        }
        summary
    }

    #[must_use]
    pub fn count(&self, event: &str) -> usize {
        self.by_event.get(event).copied().unwrap_or(0)
    }
}
