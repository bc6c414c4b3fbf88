//! Tooling around the uthread runtime: built-in scheduling scenarios,
//! run reports, and validation of the runtime's JSONL logs.

pub mod report;
pub mod scenarios;
pub mod structured_log;

pub use report::{LogSummary, RunReport, RunSummary};
pub use scenarios::{Scenario, ScenarioResult};
