//! Per-descriptor read/write locks.
//!
//! Each descriptor has an independent lock per direction so a reader and a
//! writer can use one socket concurrently while two writers are serialized.
//! Each direction has an owner, a recursion count and a FIFO queue; unlock
//! hands ownership to the queue head. The entry also remembers whether the
//! application asked for non-blocking mode, since the runtime keeps the
//! real descriptor non-blocking regardless.

use std::time::Instant;

use serde::Serialize;

use crate::errno::{Errno, Result};
use crate::queue::ThreadQueue;
use crate::tcb::{ThreadId, ThreadState, WaitSlot, WakeReason};

use super::{Scheduler, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FdDirection {
    Read,
    Write,
    /// Read then write; only meaningful to callers that split it.
    ReadWrite,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DirLock {
    owner: Option<ThreadId>,
    count: u32,
    pub(crate) waiters: ThreadQueue,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FdEntry {
    read: DirLock,
    write: DirLock,
    nonblocking: bool,
    configured: bool,
}

impl FdEntry {
    pub(crate) fn dir_mut(&mut self, dir: FdDirection) -> &mut DirLock {
        match dir {
            FdDirection::Write => &mut self.write,
            FdDirection::Read | FdDirection::ReadWrite => &mut self.read,
        }
    }

    pub(crate) fn dir(&self, dir: FdDirection) -> &DirLock {
        match dir {
            FdDirection::Write => &self.write,
            FdDirection::Read | FdDirection::ReadWrite => &self.read,
        }
    }

    /// Drops ownership and queue positions held by anyone but `keep`.
    pub(crate) fn retain_owner(&mut self, keep: ThreadId) {
        for lock in [&mut self.read, &mut self.write] {
            lock.waiters.clear();
            if lock.owner != Some(keep) {
                lock.owner = None;
                lock.count = 0;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FdLockSnapshot {
    pub read_owner: Option<ThreadId>,
    pub read_count: u32,
    pub read_waiters: Vec<ThreadId>,
    pub write_owner: Option<ThreadId>,
    pub write_count: u32,
    pub write_waiters: Vec<ThreadId>,
    pub nonblocking: bool,
}

fn single(dir: FdDirection) -> Result<FdDirection> {
    match dir {
        FdDirection::ReadWrite => Err(Errno::EINVAL),
        dir => Ok(dir),
    }
}

impl Scheduler {
    fn check_fd(&self, fd: i32) -> Result<()> {
        match usize::try_from(fd) {
            Ok(index) if index < self.config.fd_table_size => Ok(()),
            _ => Err(Errno::EBADF),
        }
    }

    /// Locks one direction of `fd`. A blocked caller learns the outcome from
    /// its wake reason: `Granted`, `Timeout` or `Closed`.
    pub fn fd_lock(
        &mut self,
        me: ThreadId,
        fd: i32,
        dir: FdDirection,
        deadline: Option<Instant>,
        now: Instant,
    ) -> Result<Step> {
        self.check_fd(fd)?;
        let dir = single(dir)?;
        let lock = self.fds.entry(fd).or_default().dir_mut(dir);
        match lock.owner {
            None => {
                lock.owner = Some(me);
                lock.count = 1;
                return Ok(Step::Done(()));
            }
            Some(owner) if owner == me => {
                lock.count = lock.count.checked_add(1).ok_or(Errno::EAGAIN)?;
                return Ok(Step::Done(()));
            }
            Some(_) => {}
        }
        if deadline.is_some_and(|deadline| deadline <= now) {
            return Err(Errno::ETIMEDOUT);
        }
        lock.waiters.push_back(me);
        let state = match dir {
            FdDirection::Write => ThreadState::FdLockWriteWait,
            _ => ThreadState::FdLockReadWait,
        };
        self.park(me, state, WaitSlot::FdLock(fd, dir), deadline);
        Ok(Step::Blocked)
    }

    pub fn fd_unlock(&mut self, me: ThreadId, fd: i32, dir: FdDirection) -> Result<()> {
        self.check_fd(fd)?;
        let dir = single(dir)?;
        let entry = self.fds.get_mut(&fd).ok_or(Errno::EBADF)?;
        let lock = entry.dir_mut(dir);
        if lock.owner != Some(me) {
            return Err(Errno::EPERM);
        }
        lock.count -= 1;
        if lock.count > 0 {
            return Ok(());
        }
        lock.owner = None;
        if let Some(next) = lock.waiters.pop_front() {
            lock.owner = Some(next);
            lock.count = 1;
            if let Some(t) = self.threads.get_mut(next.0) {
                t.slot = WaitSlot::None;
            }
            self.make_ready(next, WakeReason::Granted);
        }
        Ok(())
    }

    /// Forgets `fd`: its entry is removed and every lock waiter is woken
    /// with `Closed`.
    pub fn fd_close(&mut self, fd: i32) -> Result<()> {
        self.check_fd(fd)?;
        let Some(mut entry) = self.fds.remove(&fd) else {
            return Ok(());
        };
        let mut waiters = entry.read.waiters.drain();
        waiters.extend(entry.write.waiters.drain());
        for waiter in waiters {
            if let Some(t) = self.threads.get_mut(waiter.0) {
                t.slot = WaitSlot::None;
            }
            self.make_ready(waiter, WakeReason::Closed);
        }
        Ok(())
    }

    /// Records the application's blocking-mode choice; returns the old one.
    pub fn fd_set_nonblocking(&mut self, fd: i32, on: bool) -> Result<bool> {
        self.check_fd(fd)?;
        let entry = self.fds.entry(fd).or_default();
        Ok(std::mem::replace(&mut entry.nonblocking, on))
    }

    pub fn fd_is_nonblocking(&self, fd: i32) -> Result<bool> {
        self.check_fd(fd)?;
        Ok(self.fds.get(&fd).is_some_and(|entry| entry.nonblocking))
    }

    /// Marks the real descriptor as switched to non-blocking mode.
    /// Returns false the first time, so the caller knows to configure it
    /// and capture the application's original flag.
    pub fn fd_mark_configured(&mut self, fd: i32, user_nonblocking: bool) -> Result<bool> {
        self.check_fd(fd)?;
        let entry = self.fds.entry(fd).or_default();
        if entry.configured {
            return Ok(true);
        }
        entry.configured = true;
        entry.nonblocking = user_nonblocking;
        Ok(false)
    }

    #[must_use]
    pub fn fd_snapshot(&self, fd: i32) -> Option<FdLockSnapshot> {
        let entry = self.fds.get(&fd)?;
        let read = entry.dir(FdDirection::Read);
        let write = entry.dir(FdDirection::Write);
        Some(FdLockSnapshot {
            read_owner: read.owner,
            read_count: read.count,
            read_waiters: read.waiters.iter().collect(),
            write_owner: write.owner,
            write_count: write.count,
            write_waiters: write.waiters.iter().collect(),
            nonblocking: entry.nonblocking,
        })
    }
}
