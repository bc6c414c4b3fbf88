//! CLI entrypoint for the uthread scenario harness.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use uthread_harness::report::{LogSummary, RunReport, RunSummary};
use uthread_harness::scenarios::{self, Scenario};
use uthread_harness::structured_log::{LogLevel, validate_log_file};
use uthread_rt::{LogTarget, Mode, RuntimeConfig};

/// Scenario runner and log tooling for the uthread runtime.
#[derive(Debug, Parser)]
#[command(name = "uthread-harness")]
#[command(about = "Runs built-in scheduling scenarios against the uthread runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the built-in scenarios.
    List,
    /// Run scenarios and report the outcome.
    Run {
        /// Scenario to run; repeatable. Runs all when omitted.
        #[arg(long = "scenario")]
        scenarios: Vec<String>,
        /// Runtime mode: strict, hardened or both. Defaults to UTHREAD_MODE.
        #[arg(long)]
        mode: Option<String>,
        /// Output report path (markdown); a JSON copy is written next to it.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Append the runtime's JSONL log to this file.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Minimum level for --log.
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Validate a JSONL log written by the runtime.
    ValidateLog {
        path: PathBuf,
        /// Print event counts as JSON.
        #[arg(long)]
        summary: bool,
    },
}

fn modes(raw: Option<&str>, base: &RuntimeConfig) -> Result<Vec<Mode>, String> {
    match raw.map(str::trim) {
        None => Ok(vec![base.mode]),
        Some("both") => Ok(vec![Mode::Strict, Mode::Hardened]),
        Some("strict") => Ok(vec![Mode::Strict]),
        Some("hardened") => Ok(vec![Mode::Hardened]),
        Some(other) => Err(format!("Unsupported mode '{other}', expected strict|hardened|both")),
    }
}

fn select(names: &[String]) -> Result<Vec<Scenario>, String> {
    if names.is_empty() {
        return Ok(scenarios::all());
    }
    names
        .iter()
        .map(|name| scenarios::find(name).ok_or_else(|| format!("Unknown scenario '{name}'")))
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            for s in scenarios::all() {
                println!("{:<26} {}", s.name, s.summary);
            }
        }
        Command::Run {
            scenarios,
            mode,
            report,
            log,
            log_level,
        } => {
            let mut base = RuntimeConfig::from_env();
            if let Some(path) = log {
                let level = LogLevel::parse(&log_level)
                    .ok_or_else(|| format!("Unknown log level '{log_level}'"))?;
                base = base.with_log(LogTarget::File(path), level);
            }
            let modes = modes(mode.as_deref(), &base)?;
            let selected = select(&scenarios)?;

            let mut results = Vec::new();
            for &mode in &modes {
                let config = base.clone().with_mode(mode);
                for s in &selected {
                    let result = s.run(&config);
                    eprintln!(
                        "[{}] {} {} ({} us)",
                        result.mode,
                        result.name,
                        if result.passed { "PASS" } else { "FAIL" },
                        result.elapsed_us
                    );
                    results.push(result);
                }
            }

            let report_doc = RunReport {
                title: String::from("uthread Scenario Report"),
                mode: modes.iter().map(|m| m.label()).collect::<Vec<_>>().join("+"),
                timestamp: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs().to_string())
                    .unwrap_or_default(),
                summary: RunSummary::from_results(results),
            };
            eprintln!(
                "Run complete: total={}, passed={}, failed={}",
                report_doc.summary.total, report_doc.summary.passed, report_doc.summary.failed
            );

            if let Some(report_path) = report {
                eprintln!("Writing report to {}", report_path.display());
                std::fs::write(&report_path, report_doc.to_markdown())?;
                std::fs::write(report_path.with_extension("json"), report_doc.to_json())?;
            }

            if !report_doc.summary.all_passed() {
                return Err("Scenario run failed".into());
            }
        }
        Command::ValidateLog { path, summary } => {
            let (count, errors) = validate_log_file(&path)?;
            for err in &errors {
                eprintln!("{}: {err}", path.display());
            }
            if summary {
                let content = std::fs::read_to_string(&path)?;
                let counts = LogSummary::from_jsonl_str(&content);
                println!("{}", serde_json::to_string_pretty(&counts)?);
            }
            eprintln!("{count} entries, {} problem(s)", errors.len());
            if !errors.is_empty() {
                return Err(format!("{} is not a valid runtime log", path.display()).into());
            }
        }
    }

    Ok(())
}
