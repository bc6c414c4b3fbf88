#![cfg(target_os = "linux")]

//! Runtime configuration: modes, time slicing and the structured log.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use uthread_rt::sync::{Cond, Mutex};
use uthread_rt::{
    LogEntry, LogLevel, LogTarget, Mode, MutexAttr, Runtime, RuntimeConfig, SchedPolicy, thread,
};

fn log_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("uthread-{tag}-{}.jsonl", std::process::id()))
}

#[test]
fn equal_priority_threads_share_the_cpu_by_quantum() {
    let config = RuntimeConfig::default().with_quantum(Duration::from_millis(2));
    let started = Arc::new(AtomicBool::new(false));
    let out = Runtime::new(config).expect("runtime").block_on(move || {
        let flag = Arc::clone(&started);
        let spinner = thread::create(move || {
            let limit = Instant::now() + Duration::from_secs(5);
            while !flag.load(Ordering::SeqCst) && Instant::now() < limit {
                thread::checkpoint().expect("checkpoint");
            }
            usize::from(flag.load(Ordering::SeqCst))
        })
        .expect("spinner");
        let flag = Arc::clone(&started);
        let other = thread::create(move || {
            flag.store(true, Ordering::SeqCst);
            0
        })
        .expect("other");
        let seen = thread::join(spinner).expect("join");
        thread::join(other).expect("join");
        seen
    });
    assert_eq!(out, Ok(1));
}

#[test]
fn fifo_threads_are_not_sliced() {
    let config = RuntimeConfig::default().with_quantum(Duration::from_millis(1));
    let out = Runtime::new(config).expect("runtime").block_on(|| {
        let flag = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&flag);
        let spinner = thread::Builder::new()
            .policy(SchedPolicy::Fifo)
            .spawn(move || {
                let until = Instant::now() + Duration::from_millis(10);
                while Instant::now() < until {
                    thread::checkpoint().expect("checkpoint");
                }
                usize::from(!seen.load(Ordering::SeqCst))
            })
            .expect("spinner");
        let flag2 = Arc::clone(&flag);
        let other = thread::create(move || {
            flag2.store(true, Ordering::SeqCst);
            0
        })
        .expect("other");
        let result = thread::join(spinner).expect("join");
        thread::join(other).expect("join");
        result
    });
    assert_eq!(out, Ok(1));
}

#[test]
fn hardened_mode_checks_invariants_through_a_workload() {
    let config = RuntimeConfig::default().with_mode(Mode::Hardened);
    let out = Runtime::new(config).expect("runtime").block_on(|| {
        let m = Mutex::new(MutexAttr::default()).expect("mutex");
        let c = Cond::new().expect("cond");
        let turn = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ids: Vec<_> = (0..4)
            .map(|n| {
                let turn = Arc::clone(&turn);
                thread::create(move || {
                    m.lock().expect("lock");
                    while turn.load(Ordering::SeqCst) != n {
                        c.wait(m).expect("wait");
                    }
                    turn.fetch_add(1, Ordering::SeqCst);
                    c.broadcast().expect("broadcast");
                    m.unlock().expect("unlock");
                    n
                })
                .expect("create")
            })
            .rev()
            .collect();
        ids.into_iter().map(|id| thread::join(id).expect("join")).sum()
    });
    assert_eq!(out, Ok(6));
}

#[test]
fn the_structured_log_is_one_json_object_per_line() {
    let path = log_path("log");
    let _ = std::fs::remove_file(&path);
    let config = RuntimeConfig::default().with_log(LogTarget::File(path.clone()), LogLevel::Debug);
    let out = Runtime::new(config).expect("runtime").block_on(|| {
        let id = thread::Builder::new().name("logged").spawn(|| 9).expect("create");
        thread::join(id).expect("join")
    });
    assert_eq!(out, Ok(9));

    let text = std::fs::read_to_string(&path).expect("log file");
    let entries: Vec<LogEntry> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("each line is a log entry"))
        .collect();
    let events: Vec<&str> = entries.iter().map(|e| e.event.as_str()).collect();
    for expected in ["runtime.start", "thread.create", "thread.exit", "thread.join", "runtime.end"] {
        assert!(events.contains(&expected), "missing {expected} in {events:?}");
    }
    assert_eq!(events.first(), Some(&"runtime.start"));
    assert_eq!(events.last(), Some(&"runtime.end"));
    assert!(entries.iter().all(|e| e.level >= LogLevel::Debug));

    let ids: HashSet<&str> = entries.iter().map(|e| e.trace_id.as_str()).collect();
    assert_eq!(ids.len(), entries.len(), "trace ids are unique");
    let run = entries[0].trace_id.split("::").next().expect("run prefix");
    assert!(entries.iter().all(|e| e.trace_id.starts_with(run)));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn the_log_level_filters_records() {
    let path = log_path("warn");
    let _ = std::fs::remove_file(&path);
    let config = RuntimeConfig::default().with_log(LogTarget::File(path.clone()), LogLevel::Warn);
    let out = Runtime::new(config).expect("runtime").block_on(|| {
        let id = thread::create(|| 1).expect("create");
        thread::join(id).expect("join")
    });
    assert_eq!(out, Ok(1));
    let text = std::fs::read_to_string(&path).unwrap_or_default();
    assert!(text.lines().all(|line| !line.contains("\"thread.create\"")));
    let _ = std::fs::remove_file(&path);
}
