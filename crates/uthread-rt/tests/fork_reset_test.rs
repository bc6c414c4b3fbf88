#![cfg(target_os = "linux")]

//! Forking from inside a runtime.

use uthread_rt::sync::{Mutex, Semaphore};
use uthread_rt::{MutexAttr, Runtime, RuntimeConfig, ThreadState, io, process, thread};

/// Checks run in the forked child; returns the exit code to report.
fn child_checks(mutex: Mutex) -> i32 {
    let me = match thread::self_id() {
        Ok(me) => me,
        Err(_) => return 10,
    };
    let Ok(info) = thread::dump_info() else {
        return 11;
    };
    let others = info
        .iter()
        .filter(|i| i.id != me && !i.daemon && i.state != ThreadState::Dead)
        .count();
    if others != 0 {
        return 12;
    }
    // The parent's holder is gone, so its mutex is free here.
    if mutex.try_lock().is_err() {
        return 13;
    }
    let Ok(worker) = thread::create(|| 5) else {
        return 14;
    };
    match thread::join(worker) {
        Ok(5) => 42,
        _ => 15,
    }
}

#[test]
fn the_child_keeps_only_the_forking_thread() {
    let out = Runtime::new(RuntimeConfig::default())
        .expect("runtime")
        .block_on(|| {
            let m = Mutex::new(MutexAttr::default()).expect("mutex");
            let gate = Semaphore::new(false, 0).expect("sem");
            let holder = thread::Builder::new()
                .priority(20)
                .spawn(move || {
                    m.lock().expect("lock");
                    gate.wait().expect("wait");
                    m.unlock().expect("unlock");
                    0
                })
                .expect("holder");

            let pid = process::fork().expect("fork");
            if pid == 0 {
                let code = child_checks(m);
                // SAFETY: leaves the child without running the parent's
                // test harness teardown.
                unsafe { libc::_exit(code) };
            }

            let (reaped, status) = io::wait_child(Some(pid), false)
                .expect("wait_child")
                .expect("blocking wait returns a child");
            assert_eq!(reaped, pid);
            assert!(libc::WIFEXITED(status));
            gate.post().expect("post");
            thread::join(holder).expect("join");
            usize::try_from(libc::WEXITSTATUS(status)).unwrap_or(0)
        });
    assert_eq!(out, Ok(42));
}
