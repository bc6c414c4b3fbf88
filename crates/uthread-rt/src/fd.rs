//! Per-descriptor read and write locks.
//!
//! A descriptor is switched to `O_NONBLOCK` the first time it is locked so
//! the I/O consumers can park instead of blocking the process; the
//! blocking mode the caller asked for is kept as a logical flag.

use std::time::Instant;

use uthread_core::{Errno, FdDirection, FdLockSnapshot, Result, Step, ThreadId, WakeReason};

use crate::runtime::{CANCEL_NOW, Guard, Shared, with_runtime};

pub(crate) fn last_errno() -> Errno {
    Errno::from_raw(
        std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO),
    )
}

/// Makes the real descriptor non-blocking once, remembering whether the
/// caller had it non-blocking already.
pub(crate) fn configure(g: &mut Guard<'_>, fd: i32) -> Result<()> {
    // SAFETY: F_GETFL has no memory effects; a bad fd reports EBADF.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(last_errno());
    }
    let user_nonblocking = flags & libc::O_NONBLOCK != 0;
    if g.sched.fd_mark_configured(fd, user_nonblocking)? {
        return Ok(());
    }
    if !user_nonblocking {
        // SAFETY: as above, setting status flags on a valid descriptor.
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(last_errno());
        }
    }
    Ok(())
}

impl Shared {
    /// Takes one direction of the lock on `fd`, parking behind earlier
    /// requesters.
    pub(crate) fn fd_lock_one(
        &self,
        g: &mut Guard<'_>,
        me: ThreadId,
        fd: i32,
        dir: FdDirection,
        deadline: Option<Instant>,
    ) -> Result<()> {
        loop {
            if g.sched.take_cancel(me) {
                return Err(CANCEL_NOW);
            }
            match g.sched.fd_lock(me, fd, dir, deadline, Instant::now())? {
                Step::Done(()) => return Ok(()),
                Step::Blocked => match self.block(g, me) {
                    WakeReason::Granted => return Ok(()),
                    WakeReason::Timeout => return Err(Errno::ETIMEDOUT),
                    WakeReason::Closed => return Err(Errno::EBADF),
                    WakeReason::Canceled => return Err(CANCEL_NOW),
                    _ => {}
                },
            }
        }
    }

    pub(crate) fn fd_lock_in(
        &self,
        g: &mut Guard<'_>,
        me: ThreadId,
        fd: i32,
        dir: FdDirection,
        deadline: Option<Instant>,
    ) -> Result<()> {
        match dir {
            FdDirection::ReadWrite => {
                self.fd_lock_one(g, me, fd, FdDirection::Read, deadline)?;
                if let Err(err) = self.fd_lock_one(g, me, fd, FdDirection::Write, deadline) {
                    let _ = g.sched.fd_unlock(me, fd, FdDirection::Read);
                    return Err(err);
                }
            }
            dir => self.fd_lock_one(g, me, fd, dir, deadline)?,
        }
        if let Err(err) = configure(g, fd) {
            let _ = self.fd_unlock_in(g, me, fd, dir);
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn fd_unlock_in(
        &self,
        g: &mut Guard<'_>,
        me: ThreadId,
        fd: i32,
        dir: FdDirection,
    ) -> Result<()> {
        match dir {
            FdDirection::ReadWrite => {
                g.sched.fd_unlock(me, fd, FdDirection::Write)?;
                g.sched.fd_unlock(me, fd, FdDirection::Read)
            }
            dir => g.sched.fd_unlock(me, fd, dir),
        }
    }
}

/// Locks `fd` for `dir`, recursively for the holder. Waits are not
/// interrupted by signals; a `deadline` bounds them with `ETIMEDOUT`.
pub fn fd_lock(fd: i32, dir: FdDirection, deadline: Option<Instant>) -> Result<()> {
    with_runtime(|shared, g, me| shared.fd_lock_in(g, me, fd, dir, deadline))
}

pub fn fd_unlock(fd: i32, dir: FdDirection) -> Result<()> {
    with_runtime(|shared, g, me| shared.fd_unlock_in(g, me, fd, dir))
}

/// Closes `fd`. Threads waiting for its lock fail with `EBADF`.
pub fn fd_close(fd: i32) -> Result<()> {
    with_runtime(|_, g, _| {
        g.sched.fd_close(fd)?;
        // SAFETY: the caller hands over ownership of `fd`.
        if unsafe { libc::close(fd) } != 0 {
            return Err(last_errno());
        }
        Ok(())
    })
}

/// Sets the logical blocking mode seen by the I/O consumers; returns the
/// old one.
pub fn set_nonblocking(fd: i32, on: bool) -> Result<bool> {
    with_runtime(|_, g, _| {
        configure(g, fd)?;
        g.sched.fd_set_nonblocking(fd, on)
    })
}

pub fn is_nonblocking(fd: i32) -> Result<bool> {
    with_runtime(|_, g, _| {
        configure(g, fd)?;
        g.sched.fd_is_nonblocking(fd)
    })
}

/// Lock state of `fd`, if it has any.
pub fn fd_snapshot(fd: i32) -> Result<Option<FdLockSnapshot>> {
    with_runtime(|_, g, _| Ok(g.sched.fd_snapshot(fd)))
}
