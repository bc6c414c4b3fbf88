//! Blocking-style I/O that parks the calling green thread instead of the
//! process.

use std::time::{Duration, Instant};

use uthread_core::sched::io::{POLLIN, POLLOUT};
use uthread_core::{Errno, FdDirection, PollEntry, Result, Step, ThreadId, ThreadState, WakeReason};

use crate::fd::last_errno;
use crate::runtime::{CANCEL_NOW, Guard, Shared, with_runtime};

impl Shared {
    /// Retries `attempt` until it stops reporting `EAGAIN`, parking on
    /// `fd` readiness in between.
    fn io_retry(
        &self,
        g: &mut Guard<'_>,
        me: ThreadId,
        fd: i32,
        events: i16,
        state: ThreadState,
        mut attempt: impl FnMut() -> isize,
    ) -> Result<usize> {
        loop {
            if g.sched.take_cancel(me) {
                return Err(CANCEL_NOW);
            }
            let rc = attempt();
            if let Ok(done) = usize::try_from(rc) {
                return Ok(done);
            }
            let err = last_errno();
            match err.raw() {
                libc::EINTR => continue,
                libc::EAGAIN => {
                    if g.sched.fd_is_nonblocking(fd)? {
                        return Err(Errno::EAGAIN);
                    }
                    let entry = PollEntry::new(fd, events);
                    if let Step::Blocked = g.sched.wait_io(me, state, vec![entry], None, Instant::now())? {
                        let woke = self.block(g, me);
                        let _ = g.sched.take_poll_set(me);
                        match woke {
                            WakeReason::Interrupted(_) => return Err(Errno::EINTR),
                            WakeReason::Canceled => return Err(CANCEL_NOW),
                            _ => {}
                        }
                    }
                }
                _ => return Err(err),
            }
        }
    }

    fn locked_io(
        &self,
        g: &mut Guard<'_>,
        me: ThreadId,
        fd: i32,
        dir: FdDirection,
        attempt: impl FnMut() -> isize,
    ) -> Result<usize> {
        self.fd_lock_in(g, me, fd, dir, None)?;
        let (events, state) = match dir {
            FdDirection::Write => (POLLOUT, ThreadState::FdWriteWait),
            _ => (POLLIN, ThreadState::FdReadWait),
        };
        let result = self.io_retry(g, me, fd, events, state, attempt);
        let _ = self.fd_unlock_in(g, me, fd, dir);
        result
    }

    pub(crate) fn sleep_until(&self, g: &mut Guard<'_>, me: ThreadId, deadline: Instant) -> Result<()> {
        if g.sched.take_cancel(me) {
            return Err(CANCEL_NOW);
        }
        match g.sched.sleep_until(me, deadline, Instant::now()) {
            Step::Done(()) => Ok(()),
            Step::Blocked => match self.block(g, me) {
                WakeReason::Interrupted(_) => Err(Errno::EINTR),
                WakeReason::Canceled => Err(CANCEL_NOW),
                _ => Ok(()),
            },
        }
    }
}

/// Reads from `fd` while holding its read lock. Parks until data arrives
/// unless the descriptor is logically non-blocking.
pub fn read(fd: i32, buf: &mut [u8]) -> Result<usize> {
    with_runtime(|shared, g, me| {
        shared.locked_io(g, me, fd, FdDirection::Read, || {
            // SAFETY: `buf` is a live, writable slice of `buf.len()` bytes.
            unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) }
        })
    })
}

/// Writes to `fd` while holding its write lock. Returns after the first
/// successful partial or complete write.
pub fn write(fd: i32, buf: &[u8]) -> Result<usize> {
    with_runtime(|shared, g, me| {
        shared.locked_io(g, me, fd, FdDirection::Write, || {
            // SAFETY: `buf` is a live slice of `buf.len()` bytes.
            unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) }
        })
    })
}

/// Writes all of `buf`.
pub fn write_all(fd: i32, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = write(fd, buf)?;
        buf = &buf[n..];
    }
    Ok(())
}

fn poll_now(entries: &mut [PollEntry]) -> Result<usize> {
    let mut fds: Vec<libc::pollfd> = entries
        .iter()
        .map(|e| libc::pollfd {
            fd: e.fd,
            events: e.events,
            revents: 0,
        })
        .collect();
    // SAFETY: `fds` is a live vector of `fds.len()` records.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 0) };
    if rc < 0 {
        return Err(last_errno());
    }
    for (entry, pfd) in entries.iter_mut().zip(&fds) {
        entry.revents = pfd.revents;
    }
    Ok(usize::try_from(rc).unwrap_or(0))
}

/// Waits until one of `entries` is ready or `timeout` passes; fills in
/// `revents` and returns how many entries are ready (0 on timeout).
pub fn poll(entries: &mut [PollEntry], timeout: Option<Duration>) -> Result<usize> {
    with_runtime(|shared, g, me| {
        if g.sched.take_cancel(me) {
            return Err(CANCEL_NOW);
        }
        let ready = poll_now(entries)?;
        if ready > 0 || timeout == Some(Duration::ZERO) {
            return Ok(ready);
        }
        let now = Instant::now();
        let deadline = timeout.map(|t| now + t);
        match g.sched.wait_io(me, ThreadState::PollWait, entries.to_vec(), deadline, now) {
            Ok(Step::Blocked) => {}
            Ok(Step::Done(())) | Err(Errno::ETIMEDOUT) => return Ok(0),
            Err(err) => return Err(err),
        }
        let woke = shared.block(g, me);
        let polled = g.sched.take_poll_set(me);
        match woke {
            WakeReason::Ready => {
                for (entry, result) in entries.iter_mut().zip(&polled) {
                    entry.revents = result.revents;
                }
                Ok(entries.iter().filter(|e| e.revents != 0).count())
            }
            WakeReason::Timeout => Ok(0),
            WakeReason::Interrupted(_) => Err(Errno::EINTR),
            WakeReason::Canceled => Err(CANCEL_NOW),
            _ => poll_now(entries),
        }
    })
}

/// Sleeps for `duration`; fails with `EINTR` if a handler interrupts it.
pub fn sleep(duration: Duration) -> Result<()> {
    with_runtime(|shared, g, me| shared.sleep_until(g, me, Instant::now() + duration))
}

/// Like [`sleep`], reporting the unslept time through `remaining` when
/// interrupted.
pub fn nanosleep(duration: Duration, remaining: Option<&mut Duration>) -> Result<()> {
    let deadline = Instant::now() + duration;
    let result = with_runtime(|shared, g, me| shared.sleep_until(g, me, deadline));
    if result == Err(Errno::EINTR)
        && let Some(remaining) = remaining
    {
        *remaining = deadline.saturating_duration_since(Instant::now());
    }
    result
}

pub fn sleep_until(deadline: Instant) -> Result<()> {
    with_runtime(|shared, g, me| shared.sleep_until(g, me, deadline))
}

/// Reaps a child process (`pid` or any child). With `nohang` returns
/// `None` at once when no child has changed state; otherwise parks until
/// one does.
pub fn wait_child(pid: Option<libc::pid_t>, nohang: bool) -> Result<Option<(libc::pid_t, i32)>> {
    with_runtime(|shared, g, me| loop {
        if g.sched.take_cancel(me) {
            return Err(CANCEL_NOW);
        }
        let mut status: libc::c_int = 0;
        // SAFETY: `status` is a live out-parameter.
        let rc = unsafe { libc::waitpid(pid.unwrap_or(-1), &mut status, libc::WNOHANG) };
        if rc > 0 {
            return Ok(Some((rc, status)));
        }
        if rc < 0 {
            let err = last_errno();
            if err == Errno::EINTR {
                continue;
            }
            return Err(err);
        }
        if nohang {
            return Ok(None);
        }
        let recheck = Instant::now() + shared.config.child_recheck;
        let _ = g.sched.wait_child(me, Some(recheck));
        match shared.block(g, me) {
            WakeReason::Interrupted(_) => return Err(Errno::EINTR),
            WakeReason::Canceled => return Err(CANCEL_NOW),
            _ => {}
        }
    })
}
