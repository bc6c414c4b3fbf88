//! Mutex and scheduling hot-path microbenchmarks.
//!
//! Captures uncontended lock/unlock, try_lock, contended hand-off between
//! two threads and yield round trips, with per-mode metadata
//! (`UTHREAD_MODE`), percentile summaries and dispatches per operation.

use std::cell::RefCell;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use uthread_bench::{BenchStats, mode_label, print_env_metadata_once, time_loop, timed_run};
use uthread_rt::sync::Mutex;
use uthread_rt::{MutexAttr, SchedPolicy, thread};

const TAG: &str = "MUTEX_BENCH";

fn bench_mutex_lock_unlock(c: &mut Criterion) {
    print_env_metadata_once(TAG);
    let mode = mode_label();

    let stats = RefCell::new(BenchStats::default());
    let mut group = c.benchmark_group("mutex_hotpath");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("lock_unlock", mode), |b| {
        b.iter_custom(|iters| {
            let sample = timed_run(move || {
                let m = Mutex::new(MutexAttr::default()).expect("mutex init");
                time_loop(iters, || {
                    m.lock().expect("mutex lock");
                    m.unlock().expect("mutex unlock");
                })
            });
            stats.borrow_mut().record(iters, sample);
            sample.elapsed
        });
    });
    group.finish();
    stats.borrow().report(TAG, mode, "lock_unlock");
}

fn bench_mutex_try_lock(c: &mut Criterion) {
    print_env_metadata_once(TAG);
    let mode = mode_label();

    let stats = RefCell::new(BenchStats::default());
    let mut group = c.benchmark_group("mutex_hotpath");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("try_lock", mode), |b| {
        b.iter_custom(|iters| {
            let sample = timed_run(move || {
                let m = Mutex::new(MutexAttr::default()).expect("mutex init");
                time_loop(iters, || {
                    black_box(m.try_lock()).expect("mutex try_lock");
                    m.unlock().expect("mutex unlock");
                })
            });
            stats.borrow_mut().record(iters, sample);
            sample.elapsed
        });
    });
    group.finish();
    stats.borrow().report(TAG, mode, "try_lock");
}

/// Two equal-priority threads take turns on one mutex; every acquisition
/// after the first is a hand-off from a blocked waiter.
fn bench_mutex_handoff(c: &mut Criterion) {
    print_env_metadata_once(TAG);
    let mode = mode_label();

    let stats = RefCell::new(BenchStats::default());
    let mut group = c.benchmark_group("mutex_contended");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("handoff", mode), |b| {
        b.iter_custom(|iters| {
            let sample = timed_run(move || {
                let m = Mutex::new(MutexAttr::default()).expect("mutex init");
                let rounds = iters.div_ceil(2);
                let worker = move || {
                    for _ in 0..rounds {
                        m.lock().expect("mutex lock");
                        thread::yield_now().expect("yield");
                        m.unlock().expect("mutex unlock");
                    }
                    0
                };
                let start = Instant::now();
                let a = thread::create(worker).expect("create");
                let b = thread::create(worker).expect("create");
                thread::join(a).expect("join");
                thread::join(b).expect("join");
                start.elapsed()
            });
            stats.borrow_mut().record(iters, sample);
            sample.elapsed
        });
    });
    group.finish();
    stats.borrow().report(TAG, mode, "handoff");
}

/// Round-robin between two FIFO threads at the same priority.
fn bench_yield_pingpong(c: &mut Criterion) {
    print_env_metadata_once(TAG);
    let mode = mode_label();

    let stats = RefCell::new(BenchStats::default());
    let mut group = c.benchmark_group("sched_hotpath");
    group.throughput(Throughput::Elements(1));
    group.bench_function(BenchmarkId::new("yield", mode), |b| {
        b.iter_custom(|iters| {
            let sample = timed_run(move || {
                let rounds = iters.div_ceil(2);
                let worker = move || {
                    for _ in 0..rounds {
                        thread::yield_now().expect("yield");
                    }
                    0
                };
                let spawn = || {
                    thread::Builder::new()
                        .policy(SchedPolicy::Fifo)
                        .spawn(worker)
                        .expect("create")
                };
                let start = Instant::now();
                let a = spawn();
                let b = spawn();
                thread::join(a).expect("join");
                thread::join(b).expect("join");
                start.elapsed()
            });
            stats.borrow_mut().record(iters, sample);
            sample.elapsed
        });
    });
    group.finish();
    stats.borrow().report(TAG, mode, "yield");
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(1))
        .measurement_time(Duration::from_secs(2))
        .sample_size(60);
    targets = bench_mutex_lock_unlock, bench_mutex_try_lock, bench_mutex_handoff, bench_yield_pingpong
);
criterion_main!(benches);
