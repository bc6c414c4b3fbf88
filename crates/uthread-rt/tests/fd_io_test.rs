#![cfg(target_os = "linux")]

//! Integration tests for descriptor locks and the I/O consumers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use uthread_rt::{
    Errno, FdDirection, PollEntry, Runtime, RuntimeConfig, ThreadState, fd, io, thread,
};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).expect("runtime should start")
}

fn pipe() -> (i32, i32) {
    let mut fds = [0; 2];
    // SAFETY: `fds` has room for the two descriptors.
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe should succeed");
    (fds[0], fds[1])
}

fn close(fd: i32) {
    // SAFETY: the test owns `fd`.
    unsafe { libc::close(fd) };
}

fn state_of(id: uthread_rt::ThreadId) -> Option<ThreadState> {
    thread::dump_info()
        .expect("dump")
        .into_iter()
        .find(|i| i.id == id)
        .map(|i| i.state)
}

#[test]
fn releasing_a_write_lock_wakes_the_first_queued_writer() {
    let (r, w) = pipe();
    let trace: Arc<StdMutex<Vec<&'static str>>> = Arc::default();
    let seen = Arc::clone(&trace);
    let out = runtime().block_on(move || {
        fd::fd_lock(w, FdDirection::Write, None).expect("lock");
        let spawn = |tag: &'static str| {
            let t = Arc::clone(&seen);
            thread::Builder::new()
                .priority(20)
                .spawn(move || {
                    fd::fd_lock(w, FdDirection::Write, None).expect("queued lock");
                    t.lock().expect("trace lock").push(tag);
                    fd::fd_unlock(w, FdDirection::Write).expect("unlock");
                    0
                })
                .expect("create")
        };
        let first = spawn("first");
        let second = spawn("second");

        let snap = fd::fd_snapshot(w).expect("snapshot").expect("entry");
        assert_eq!(snap.write_owner, Some(thread::self_id().expect("self")));
        assert_eq!(snap.write_waiters, vec![first, second]);
        assert_eq!(state_of(first), Some(ThreadState::FdLockWriteWait));

        fd::fd_unlock(w, FdDirection::Write).expect("unlock");
        thread::join(first).expect("join");
        thread::join(second).expect("join");
        let snap = fd::fd_snapshot(w).expect("snapshot").expect("entry");
        assert_eq!(snap.write_owner, None);
        0
    });
    assert_eq!(out, Ok(0));
    assert_eq!(*trace.lock().expect("trace lock"), vec!["first", "second"]);
    close(r);
    close(w);
}

#[test]
fn fd_locks_nest_for_their_holder_and_check_arguments() {
    let (r, w) = pipe();
    let out = runtime().block_on(move || {
        fd::fd_lock(r, FdDirection::ReadWrite, None).expect("lock both");
        fd::fd_lock(r, FdDirection::Read, None).expect("nested");
        let snap = fd::fd_snapshot(r).expect("snapshot").expect("entry");
        assert_eq!((snap.read_count, snap.write_count), (2, 1));
        fd::fd_unlock(r, FdDirection::Read).expect("unlock nested");
        fd::fd_unlock(r, FdDirection::ReadWrite).expect("unlock both");
        assert_eq!(fd::fd_unlock(r, FdDirection::Read), Err(Errno::EPERM));
        assert_eq!(fd::fd_lock(-1, FdDirection::Read, None), Err(Errno::EBADF));

        let checker = thread::Builder::new()
            .priority(20)
            .spawn(move || {
                let held = fd::fd_lock(w, FdDirection::Write, None);
                assert_eq!(held, Ok(()));
                io::sleep(Duration::from_millis(5)).expect("sleep");
                fd::fd_unlock(w, FdDirection::Write).expect("unlock");
                0
            })
            .expect("checker");
        let past = Instant::now();
        assert_eq!(fd::fd_lock(w, FdDirection::Write, Some(past)), Err(Errno::ETIMEDOUT));
        thread::join(checker).expect("join");
        0
    });
    assert_eq!(out, Ok(0));
    close(r);
    close(w);
}

#[test]
fn closing_a_descriptor_fails_its_lock_waiters() {
    let (r, w) = pipe();
    let out = runtime().block_on(move || {
        fd::fd_lock(r, FdDirection::Read, None).expect("lock");
        let waiter = thread::Builder::new()
            .priority(20)
            .spawn(move || match fd::fd_lock(r, FdDirection::Read, None) {
                Err(Errno::EBADF) => 1,
                other => panic!("expected EBADF, got {other:?}"),
            })
            .expect("create");
        fd::fd_close(r).expect("close");
        assert_eq!(fd::fd_snapshot(r), Ok(None));
        thread::join(waiter).expect("join")
    });
    assert_eq!(out, Ok(1));
    close(w);
}

#[test]
fn read_parks_the_thread_until_data_arrives() {
    let (r, w) = pipe();
    let out = runtime().block_on(move || {
        let reader = thread::Builder::new()
            .priority(20)
            .spawn(move || {
                let mut buf = [0u8; 16];
                let n = io::read(r, &mut buf).expect("read");
                assert_eq!(&buf[..n], b"hello");
                n
            })
            .expect("create");
        assert_eq!(state_of(reader), Some(ThreadState::FdReadWait));
        assert_eq!(fd::is_nonblocking(r), Ok(false));

        io::write_all(w, b"hello").expect("write");
        thread::join(reader).expect("join")
    });
    assert_eq!(out, Ok(5));
    close(r);
    close(w);
}

#[test]
fn ready_descriptor_wakes_reader_while_others_stay_runnable() {
    let (r, w) = pipe();
    let out = runtime().block_on(move || {
        let done = Arc::new(AtomicBool::new(false));
        let reader_done = Arc::clone(&done);
        let reader = thread::Builder::new()
            .priority(20)
            .spawn(move || {
                let mut buf = [0u8; 4];
                let n = io::read(r, &mut buf).expect("read");
                reader_done.store(true, Ordering::SeqCst);
                n
            })
            .expect("create");
        let peer_done = Arc::clone(&done);
        let peer = thread::create(move || {
            while !peer_done.load(Ordering::SeqCst) {
                thread::yield_now().expect("yield");
            }
            0
        })
        .expect("create");
        assert_eq!(state_of(reader), Some(ThreadState::FdReadWait));

        // Written behind the runtime's back; only the readiness pass sees it.
        // SAFETY: `w` is the open write end and the buffer is one byte.
        assert_eq!(unsafe { libc::write(w, b"x".as_ptr().cast(), 1) }, 1);
        let mut passes = 0;
        while !done.load(Ordering::SeqCst) && passes < 2000 {
            if passes % 2 == 0 {
                thread::yield_now().expect("yield");
            } else {
                thread::checkpoint().expect("checkpoint");
            }
            passes += 1;
        }
        assert!(passes <= 1, "reader woke after {passes} passes");
        thread::join(peer).expect("join");
        thread::join(reader).expect("join")
    });
    assert_eq!(out, Ok(1));
    close(r);
    close(w);
}

#[test]
fn expired_sleeper_preempts_at_the_next_checkpoint() {
    let out = runtime().block_on(|| {
        let woke = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&woke);
        let sleeper = thread::Builder::new()
            .priority(20)
            .spawn(move || {
                io::sleep(Duration::from_millis(5)).expect("sleep");
                flag.store(true, Ordering::SeqCst);
                0
            })
            .expect("create");
        assert_eq!(state_of(sleeper), Some(ThreadState::SleepWait));

        let start = Instant::now();
        let mut checkpoints = 0;
        while !woke.load(Ordering::SeqCst) && checkpoints < 1000 {
            std::thread::sleep(Duration::from_micros(500));
            thread::checkpoint().expect("checkpoint");
            checkpoints += 1;
        }
        assert!(woke.load(Ordering::SeqCst), "sleeper still asleep after {checkpoints} checkpoints");
        assert!(start.elapsed() < Duration::from_millis(250));
        thread::join(sleeper).expect("join")
    });
    assert_eq!(out, Ok(0));
}

#[test]
fn logically_nonblocking_descriptors_report_eagain() {
    let (r, w) = pipe();
    let out = runtime().block_on(move || {
        assert_eq!(fd::set_nonblocking(r, true), Ok(false));
        let mut buf = [0u8; 4];
        assert_eq!(io::read(r, &mut buf), Err(Errno::EAGAIN));
        assert_eq!(fd::set_nonblocking(r, false), Ok(true));
        assert_eq!(io::write(w, b"ok"), Ok(2));
        assert_eq!(io::read(r, &mut buf), Ok(2));
        0
    });
    assert_eq!(out, Ok(0));
    close(r);
    close(w);
}

#[test]
fn poll_times_out_and_reports_readiness() {
    let (r, w) = pipe();
    let out = runtime().block_on(move || {
        let mut entries = [PollEntry::new(r, libc::POLLIN)];
        let start = Instant::now();
        assert_eq!(io::poll(&mut entries, Some(Duration::from_millis(20))), Ok(0));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(io::poll(&mut entries, Some(Duration::ZERO)), Ok(0));

        let writer = thread::create(move || io::write(w, b"x").expect("write")).expect("create");
        assert_eq!(io::poll(&mut entries, None), Ok(1));
        assert_ne!(entries[0].revents & libc::POLLIN, 0);
        thread::join(writer).expect("join")
    });
    assert_eq!(out, Ok(1));
    close(r);
    close(w);
}

#[test]
fn sleep_lasts_at_least_the_requested_time() {
    let out = runtime().block_on(|| {
        let start = Instant::now();
        io::sleep(Duration::from_millis(15)).expect("sleep");
        assert!(start.elapsed() >= Duration::from_millis(15));

        let mut left = Duration::from_secs(9);
        io::nanosleep(Duration::from_millis(5), Some(&mut left)).expect("nanosleep");
        assert_eq!(left, Duration::from_secs(9), "untouched unless interrupted");
        io::sleep(Duration::ZERO).expect("zero sleep");
        0
    });
    assert_eq!(out, Ok(0));
}

#[test]
fn wait_child_without_children_reports_echild() {
    let out = runtime().block_on(|| {
        assert_eq!(io::wait_child(None, true), Err(Errno::ECHILD));
        0
    });
    assert_eq!(out, Ok(0));
}
