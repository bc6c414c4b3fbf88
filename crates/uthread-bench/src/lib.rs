//! Shared measurement helpers for the runtime benchmarks.
//!
//! Every sample carries the wall time of the measured loop and the number
//! of scheduler passes it caused, so each summary line reports switching
//! cost next to latency. Lines are tagged with the runtime mode taken from
//! `UTHREAD_MODE`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use uthread_rt::{Runtime, RuntimeConfig, thread};

/// One measured loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub elapsed: Duration,
    pub dispatches: u64,
}

/// Per-operation figures over every sample of one benchmark.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub samples: usize,
    pub p50_ns: f64,
    pub p95_ns: f64,
    pub max_ns: f64,
    pub mean_ns: f64,
    pub ops_per_sec: f64,
    pub dispatches_per_op: f64,
}

#[derive(Debug, Default)]
pub struct BenchStats {
    ns_per_op: Vec<f64>,
    iters: u64,
    elapsed: Duration,
    dispatches: u64,
}

impl BenchStats {
    pub fn record(&mut self, iters: u64, sample: Sample) {
        let iters = iters.max(1);
        self.iters = self.iters.saturating_add(iters);
        self.elapsed = self.elapsed.saturating_add(sample.elapsed);
        self.dispatches = self.dispatches.saturating_add(sample.dispatches);
        self.ns_per_op.push(sample.elapsed.as_nanos() as f64 / iters as f64);
    }

    #[must_use]
    pub fn summary(&self) -> Option<Summary> {
        if self.ns_per_op.is_empty() {
            return None;
        }
        let mut sorted = self.ns_per_op.clone();
        sorted.sort_by(f64::total_cmp);
        let secs = self.elapsed.as_secs_f64();
        Some(Summary {
            samples: sorted.len(),
            p50_ns: nearest_rank(&sorted, 50),
            p95_ns: nearest_rank(&sorted, 95),
            max_ns: sorted[sorted.len() - 1],
            mean_ns: sorted.iter().sum::<f64>() / sorted.len() as f64,
            ops_per_sec: if secs > 0.0 { self.iters as f64 / secs } else { 0.0 },
            dispatches_per_op: self.dispatches as f64 / self.iters.max(1) as f64,
        })
    }

    pub fn report(&self, tag: &str, mode: &str, bench: &str) {
        let Some(s) = self.summary() else {
            return;
        };
        println!(
            "{tag} mode={mode} bench={bench} samples={} p50_ns_op={:.3} p95_ns_op={:.3} max_ns_op={:.3} mean_ns_op={:.3} ops_s={:.1} dispatches_op={:.3}",
            s.samples, s.p50_ns, s.p95_ns, s.max_ns, s.mean_ns, s.ops_per_sec, s.dispatches_per_op
        );
    }
}

/// Nearest-rank percentile of an ascending slice; `pct` is clamped to 100.
#[must_use]
pub fn nearest_rank(sorted: &[f64], pct: u32) -> f64 {
    let Some(last) = sorted.len().checked_sub(1) else {
        return 0.0;
    };
    let rank = (sorted.len() * pct.min(100) as usize).div_ceil(100);
    sorted[rank.saturating_sub(1).min(last)]
}

#[must_use]
pub fn bench_config() -> RuntimeConfig {
    RuntimeConfig::from_env()
}

#[must_use]
pub fn mode_label() -> &'static str {
    bench_config().mode.label()
}

pub fn print_env_metadata_once(tag: &str) {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let mode_raw = std::env::var("UTHREAD_MODE").unwrap_or_else(|_| "<unset>".to_string());
        println!("{tag}_META uthread_mode_env={mode_raw}");
    });
}

/// Runs `body` as the main thread of a fresh runtime and samples it.
///
/// `body` times its own loop, so runtime start-up and teardown stay out of
/// the elapsed time. The dispatch count spans the whole body, thread
/// creation and joins included.
pub fn timed_run(body: impl FnOnce() -> Duration + 'static) -> Sample {
    let dispatches = Arc::new(AtomicU64::new(0));
    let counted = Arc::clone(&dispatches);
    let run = Runtime::new(bench_config()).and_then(|rt| {
        rt.block_on(move || {
            let before = thread::dispatch_count().unwrap_or(0);
            let elapsed = body();
            let after = thread::dispatch_count().unwrap_or(before);
            counted.store(after.saturating_sub(before), Ordering::Relaxed);
            usize::try_from(elapsed.as_nanos()).unwrap_or(usize::MAX)
        })
    });
    match run {
        Ok(ns) => Sample {
            elapsed: Duration::from_nanos(u64::try_from(ns).unwrap_or(u64::MAX))
                .max(Duration::from_nanos(1)),
            dispatches: dispatches.load(Ordering::Relaxed),
        },
        Err(err) => panic!("benchmark runtime failed: {err}"),
    }
}

/// Wall time of `op` repeated `iters` times; for bodies with no set-up.
pub fn time_loop(iters: u64, mut op: impl FnMut()) -> Duration {
    let start = Instant::now();
    for _ in 0..iters {
        op();
    }
    start.elapsed()
}
