#![cfg(target_os = "linux")]

//! Integration tests for thread creation, termination and scheduling.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use uthread_rt::sync::{Mutex, Semaphore};
use uthread_rt::{
    CANCELED, Errno, MutexAttr, Runtime, RuntimeConfig, RuntimeError, SchedPolicy, ThreadState,
    io, thread,
};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).expect("runtime should start")
}

type Trace = Arc<StdMutex<Vec<&'static str>>>;

fn record(trace: &Trace, tag: &'static str) {
    trace.lock().expect("trace lock").push(tag);
}

#[test]
fn create_join_returns_values_and_gc_frees_threads() {
    let out = runtime().block_on(|| {
        let ids: Vec<_> = (1..=3)
            .map(|n| thread::create(move || n * 10).expect("create"))
            .collect();
        let sum: usize = ids.iter().map(|&id| thread::join(id).expect("join")).sum();
        assert_eq!(sum, 60);

        // The collector runs at the lowest priority, so give it the CPU.
        io::sleep(Duration::from_millis(20)).expect("sleep");
        let known: Vec<_> = thread::dump_info().expect("dump").into_iter().map(|i| i.id).collect();
        for id in &ids {
            assert!(!known.contains(id), "{id} should have been collected");
            assert_eq!(thread::join(*id), Err(Errno::ESRCH));
        }
        sum
    });
    assert_eq!(out, Ok(60));
}

#[test]
fn join_rejects_self_and_detached_targets() {
    let out = runtime().block_on(|| {
        let me = thread::self_id().expect("self");
        assert_eq!(thread::join(me), Err(Errno::EDEADLK));

        let id = thread::Builder::new().detached().spawn(|| 1).expect("create");
        assert_eq!(thread::join(id), Err(Errno::EINVAL));
        assert_eq!(thread::detach(id), Err(Errno::EINVAL));
        0
    });
    assert_eq!(out, Ok(0));
}

#[test]
fn exit_runs_cleanup_handlers_newest_first() {
    let trace: Trace = Arc::default();
    let seen = Arc::clone(&trace);
    let out = runtime().block_on(move || {
        let inner = Arc::clone(&seen);
        let id = thread::create(move || {
            let first = Arc::clone(&inner);
            let second = Arc::clone(&inner);
            thread::cleanup_push(move || record(&first, "outer"));
            thread::cleanup_push(move || record(&second, "inner"));
            thread::exit(7)
        })
        .expect("create");
        thread::join(id).expect("join")
    });
    assert_eq!(out, Ok(7));
    assert_eq!(*trace.lock().expect("trace lock"), vec!["inner", "outer"]);
}

#[test]
fn cleanup_pop_runs_handler_only_when_asked() {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let out = runtime().block_on(move || {
        let a = Arc::clone(&seen);
        thread::cleanup_push(move || {
            a.fetch_add(1, Ordering::SeqCst);
        });
        thread::cleanup_pop(false);
        let b = Arc::clone(&seen);
        thread::cleanup_push(move || {
            b.fetch_add(10, Ordering::SeqCst);
        });
        thread::cleanup_pop(true);
        0
    });
    assert_eq!(out, Ok(0));
    assert_eq!(count.load(Ordering::SeqCst), 10);
}

#[test]
fn higher_priority_threads_run_first() {
    let trace: Trace = Arc::default();
    let seen = Arc::clone(&trace);
    let out = runtime().block_on(move || {
        let me = thread::self_id().expect("self");
        thread::set_schedparam(me, SchedPolicy::Fifo, 31).expect("raise self");
        for (prio, tag) in [(5u8, "p5"), (20, "p20"), (10, "p10")] {
            let t = Arc::clone(&seen);
            thread::Builder::new()
                .priority(prio)
                .detached()
                .spawn(move || {
                    record(&t, tag);
                    0
                })
                .expect("create");
        }
        assert!(seen.lock().expect("trace lock").is_empty());
        thread::set_schedparam(me, SchedPolicy::Fifo, 1).expect("lower self");
        0
    });
    assert_eq!(out, Ok(0));
    assert_eq!(*trace.lock().expect("trace lock"), vec!["p20", "p10", "p5"]);
}

#[test]
fn unlocking_hands_the_cpu_to_the_higher_priority_waiter() {
    let trace: Trace = Arc::default();
    let seen = Arc::clone(&trace);
    let out = runtime().block_on(move || {
        let m = Mutex::new(MutexAttr::default()).expect("mutex");
        m.lock().expect("lock");

        let tc = Arc::clone(&seen);
        let c = thread::Builder::new()
            .priority(10)
            .spawn(move || {
                record(&tc, "C");
                0
            })
            .expect("create C");
        let tb = Arc::clone(&seen);
        let b = thread::Builder::new()
            .priority(20)
            .spawn(move || {
                m.lock().expect("B lock");
                record(&tb, "B");
                m.unlock().expect("B unlock");
                0
            })
            .expect("create B");

        // B already ran and is parked on the mutex.
        assert!(seen.lock().expect("trace lock").is_empty());
        let info = thread::dump_info().expect("dump");
        let b_info = info.iter().find(|i| i.id == b).expect("B listed");
        assert_eq!(b_info.state, ThreadState::MutexWait);

        m.unlock().expect("unlock");
        assert_eq!(*seen.lock().expect("trace lock"), vec!["B"]);
        thread::join(b).expect("join B");
        thread::join(c).expect("join C");
        0
    });
    assert_eq!(out, Ok(0));
    assert_eq!(*trace.lock().expect("trace lock"), vec!["B", "C"]);
}

#[test]
fn equal_priority_threads_alternate_on_yield() {
    let trace: Trace = Arc::default();
    let seen = Arc::clone(&trace);
    let out = runtime().block_on(move || {
        let spawn = |tag_a: &'static str, tag_b: &'static str| {
            let t = Arc::clone(&seen);
            thread::Builder::new()
                .policy(SchedPolicy::Fifo)
                .priority(20)
                .spawn(move || {
                    record(&t, tag_a);
                    thread::yield_now().expect("yield");
                    record(&t, tag_b);
                    0
                })
                .expect("create")
        };
        let me = thread::self_id().expect("self");
        let passes = thread::dispatch_count().expect("dispatch count");
        thread::set_schedparam(me, SchedPolicy::Fifo, 31).expect("raise self");
        let a = spawn("a1", "a2");
        let b = spawn("b1", "b2");
        thread::set_schedparam(me, SchedPolicy::Fifo, 15).expect("lower self");
        thread::join(a).expect("join a");
        thread::join(b).expect("join b");
        // At least the preemption, two yields and two exits.
        assert!(thread::dispatch_count().expect("dispatch count") >= passes + 5);
        0
    });
    assert_eq!(out, Ok(0));
    assert_eq!(*trace.lock().expect("trace lock"), vec!["a1", "b1", "a2", "b2"]);
}

#[test]
fn canceling_a_waiter_runs_its_cleanup_and_reports_canceled() {
    let cleaned = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cleaned);
    let out = runtime().block_on(move || {
        let sem = Semaphore::new(false, 0).expect("sem");
        let id = thread::Builder::new()
            .priority(20)
            .spawn(move || {
                thread::cleanup_push(move || flag.store(true, Ordering::SeqCst));
                let _ = sem.wait();
                unreachable!("the wait is canceled");
            })
            .expect("create");
        thread::cancel(id).expect("cancel");
        thread::join(id).expect("join")
    });
    assert_eq!(out, Ok(CANCELED));
    assert!(cleaned.load(Ordering::SeqCst));
}

#[test]
fn disabled_cancellation_is_held_until_testcancel() {
    let reached = Arc::new(AtomicUsize::new(0));
    let steps = Arc::clone(&reached);
    let out = runtime().block_on(move || {
        let id = thread::create(move || {
            thread::set_cancel_state(uthread_rt::CancelState::Disabled).expect("disable");
            thread::yield_now().expect("yield");
            steps.fetch_add(1, Ordering::SeqCst);
            thread::set_cancel_state(uthread_rt::CancelState::Enabled).expect("enable");
            thread::testcancel();
            steps.fetch_add(100, Ordering::SeqCst);
            0
        })
        .expect("create");
        thread::yield_now().expect("yield");
        thread::cancel(id).expect("cancel");
        thread::join(id).expect("join")
    });
    assert_eq!(out, Ok(CANCELED));
    assert_eq!(reached.load(Ordering::SeqCst), 1);
}

#[test]
fn suspended_threads_wait_for_resume() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let out = runtime().block_on(move || {
        let id = thread::Builder::new()
            .priority(20)
            .suspended()
            .spawn(move || {
                flag.store(true, Ordering::SeqCst);
                0
            })
            .expect("create");
        thread::yield_now().expect("yield");
        let state = |id| {
            thread::dump_info()
                .expect("dump")
                .into_iter()
                .find(|i| i.id == id)
                .map(|i| i.state)
        };
        assert_eq!(state(id), Some(ThreadState::Suspended));
        thread::resume(id).expect("resume");
        thread::join(id).expect("join")
    });
    assert_eq!(out, Ok(0));
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn suspend_during_a_wait_takes_effect_when_the_wait_ends() {
    let progress = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&progress);
    let out = runtime().block_on(move || {
        let sem = Semaphore::new(false, 0).expect("sem");
        let id = thread::Builder::new()
            .priority(20)
            .spawn(move || {
                sem.wait().expect("wait");
                seen.fetch_add(1, Ordering::SeqCst);
                0
            })
            .expect("create");
        thread::suspend(id).expect("suspend");
        sem.post().expect("post");
        thread::yield_now().expect("yield");
        assert_eq!(progress.load(Ordering::SeqCst), 0);
        thread::resume(id).expect("resume");
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        thread::join(id).expect("join")
    });
    assert_eq!(out, Ok(0));
}

#[test]
fn thread_names_round_trip() {
    let out = runtime().block_on(|| {
        let id = thread::Builder::new()
            .name("worker")
            .suspended()
            .spawn(|| 0)
            .expect("create");
        assert_eq!(thread::name(id), Ok(Some("worker".to_string())));
        thread::set_name(id, Some("renamed".to_string())).expect("rename");
        assert_eq!(thread::name(id), Ok(Some("renamed".to_string())));
        thread::resume(id).expect("resume");
        thread::join(id).expect("join")
    });
    assert_eq!(out, Ok(0));
}

#[test]
fn exit_from_main_waits_for_the_other_threads() {
    let done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&done);
    let out = runtime().block_on(move || {
        thread::Builder::new()
            .detached()
            .spawn(move || {
                io::sleep(Duration::from_millis(10)).expect("sleep");
                flag.store(true, Ordering::SeqCst);
                0
            })
            .expect("create");
        thread::exit(3)
    });
    assert_eq!(out, Ok(3));
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn a_panicking_thread_ends_the_run() {
    let out = runtime().block_on(|| {
        let id = thread::create(|| panic!("boom")).expect("create");
        let _ = thread::join(id);
        0
    });
    match out {
        Err(RuntimeError::Panicked { message, .. }) => assert_eq!(message, "boom"),
        other => panic!("expected a panic outcome, got {other:?}"),
    }
}

#[test]
fn a_cycle_of_waits_is_reported_as_deadlock() {
    let out = runtime().block_on(|| {
        let m = Mutex::new(MutexAttr::default()).expect("mutex");
        m.lock().expect("lock");
        let id = thread::create(move || {
            let _ = m.lock();
            0
        })
        .expect("create");
        let _ = thread::join(id);
        0
    });
    assert!(matches!(out, Err(RuntimeError::Deadlock { .. })), "{out:?}");
}

#[test]
fn nested_block_on_is_rejected() {
    let out = runtime().block_on(|| {
        let inner = runtime().block_on(|| 1);
        assert_eq!(inner, Err(RuntimeError::Nested));
        0
    });
    assert_eq!(out, Ok(0));
}

#[test]
fn api_calls_outside_a_runtime_fail_with_eperm() {
    assert_eq!(thread::self_id(), Err(Errno::EPERM));
    assert_eq!(thread::dispatch_count(), Err(Errno::EPERM));
    assert_eq!(thread::create(|| 0), Err(Errno::EPERM));
    assert_eq!(io::sleep(Duration::from_millis(1)), Err(Errno::EPERM));
}
