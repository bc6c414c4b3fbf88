//! Descriptor, sleep, child and spin waits.
//!
//! The core never polls. A thread blocked on descriptors records its poll
//! set; the runtime gathers [`Scheduler::io_interest`] into one `poll(2)`
//! call and hands the results back through [`Scheduler::io_ready`].

use std::time::Instant;

use serde::Serialize;

use crate::errno::{Errno, Result};
use crate::tcb::{ThreadId, ThreadState, WaitSlot, WakeReason};

use super::{Scheduler, Step};

pub const POLLIN: i16 = 0x001;
pub const POLLPRI: i16 = 0x002;
pub const POLLOUT: i16 = 0x004;
pub const POLLERR: i16 = 0x008;
pub const POLLHUP: i16 = 0x010;
pub const POLLNVAL: i16 = 0x020;

/// Conditions reported whether or not they were asked for.
const ALWAYS: i16 = POLLERR | POLLHUP | POLLNVAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollEntry {
    pub fd: i32,
    pub events: i16,
    pub revents: i16,
}

impl PollEntry {
    #[must_use]
    pub fn new(fd: i32, events: i16) -> Self {
        Self {
            fd,
            events,
            revents: 0,
        }
    }

    fn is_ready(&self) -> bool {
        self.revents & (self.events | ALWAYS) != 0
    }
}

impl Scheduler {
    /// Parks `me` until one of `entries` is ready, the deadline passes, or
    /// a signal interrupts. `state` is one of the descriptor wait states.
    pub fn wait_io(
        &mut self,
        me: ThreadId,
        state: ThreadState,
        entries: Vec<PollEntry>,
        deadline: Option<Instant>,
        now: Instant,
    ) -> Result<Step> {
        if !matches!(
            state,
            ThreadState::FdReadWait
                | ThreadState::FdWriteWait
                | ThreadState::SelectWait
                | ThreadState::PollWait
        ) {
            return Err(Errno::EINVAL);
        }
        if entries.iter().any(|e| e.fd < 0) {
            return Err(Errno::EBADF);
        }
        if deadline.is_some_and(|deadline| deadline <= now) {
            return Err(Errno::ETIMEDOUT);
        }
        self.live_tcb(me)?;
        if let Some(t) = self.threads.get_mut(me.0) {
            t.poll_set = entries;
        }
        self.io_waiters.push(me);
        self.park(me, state, WaitSlot::Io, deadline);
        Ok(Step::Blocked)
    }

    #[must_use]
    pub fn has_io_waiters(&self) -> bool {
        !self.io_waiters.is_empty()
    }

    /// Every descriptor some thread is blocked on, merged per fd.
    #[must_use]
    pub fn io_interest(&self) -> Vec<PollEntry> {
        let mut merged: Vec<PollEntry> = Vec::new();
        for &id in &self.io_waiters {
            let Some(t) = self.tcb(id) else { continue };
            for entry in &t.poll_set {
                match merged.iter_mut().find(|m| m.fd == entry.fd) {
                    Some(m) => m.events |= entry.events,
                    None => merged.push(PollEntry::new(entry.fd, entry.events)),
                }
            }
        }
        merged
    }

    /// Feeds `poll(2)` results back. Every waiter with a ready entry gets
    /// its `revents` filled in and is woken with `Ready`. Returns how many
    /// threads were woken.
    pub fn io_ready(&mut self, results: &[PollEntry]) -> usize {
        let mut woken = Vec::new();
        for &id in &self.io_waiters {
            let Some(t) = self.threads.get_mut(id.0) else {
                continue;
            };
            let mut any = false;
            for entry in &mut t.poll_set {
                entry.revents = results
                    .iter()
                    .filter(|r| r.fd == entry.fd)
                    .fold(0, |acc, r| acc | r.revents)
                    & (entry.events | ALWAYS);
                any |= entry.is_ready();
            }
            if any {
                woken.push(id);
            }
        }
        for &id in &woken {
            self.wake(id, WakeReason::Ready);
        }
        woken.len()
    }

    /// Takes back the poll set of a completed descriptor wait.
    pub fn take_poll_set(&mut self, me: ThreadId) -> Vec<PollEntry> {
        self.threads
            .get_mut(me.0)
            .map(|t| std::mem::take(&mut t.poll_set))
            .unwrap_or_default()
    }

    /// Sleeps until `deadline`. A deadline already reached completes
    /// without blocking.
    pub fn sleep_until(&mut self, me: ThreadId, deadline: Instant, now: Instant) -> Step {
        if deadline <= now {
            return Step::Done(());
        }
        self.park(me, ThreadState::SleepWait, WaitSlot::Sleep, Some(deadline));
        Step::Blocked
    }

    /// Waits for a child-process event. `recheck` bounds the wait so the
    /// runtime can poll `waitpid` even if the SIGCHLD was coalesced away.
    pub fn wait_child(&mut self, me: ThreadId, recheck: Option<Instant>) -> Step {
        self.child_waiters.push_back(me);
        self.park(me, ThreadState::WaitWait, WaitSlot::Child, recheck);
        Step::Blocked
    }

    /// Wakes every thread in a child wait. Returns how many were woken.
    pub fn child_event(&mut self) -> usize {
        let waiters = self.child_waiters.drain();
        for &id in &waiters {
            if let Some(t) = self.threads.get_mut(id.0) {
                t.slot = WaitSlot::None;
            }
            self.make_ready(id, WakeReason::Notified);
        }
        waiters.len()
    }

    /// Blocks `me` until the next dispatch re-admits it, behind every
    /// thread that is ready now.
    pub fn spin_block(&mut self, me: ThreadId) -> Step {
        self.spinners.push_back(me);
        self.park(me, ThreadState::SpinBlock, WaitSlot::Spin, None);
        Step::Blocked
    }
}
