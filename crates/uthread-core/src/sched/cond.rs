//! Condition variables.
//!
//! Waiters queue FIFO. While a condvar has waiters it is bound to the one
//! mutex they passed; the binding clears when the queue drains.
//!
//! A wait is two scheduler steps: [`Scheduler::cond_wait`] releases the
//! mutex and parks, then after any wake the runtime drives
//! [`Scheduler::cond_relock`] until the mutex (with its saved recursion
//! count) is owned again. [`cond_wait_result`] maps the wake reason to the
//! caller-visible return.

use std::time::Instant;

use crate::arena::arena_handle;
use crate::errno::{Errno, Result};
use crate::queue::ThreadQueue;
use crate::tcb::{ThreadId, ThreadState, WaitSlot, WakeReason};

use super::mutex::MutexId;
use super::{Scheduler, Step};

arena_handle!(
    /// Handle of a condition variable.
    CondId,
    "c"
);

#[derive(Debug, Clone, Default)]
pub(crate) struct CondState {
    pub(crate) mutex: Option<MutexId>,
    pub(crate) waiters: ThreadQueue,
}

/// Caller-visible result of a completed wait. A signal interruption is a
/// spurious wakeup, a timeout is `ETIMEDOUT`.
pub fn cond_wait_result(reason: WakeReason) -> Result<()> {
    match reason {
        WakeReason::Timeout => Err(Errno::ETIMEDOUT),
        _ => Ok(()),
    }
}

impl Scheduler {
    pub fn cond_init(&mut self) -> CondId {
        CondId(self.conds.insert(CondState::default()))
    }

    pub fn cond_destroy(&mut self, id: CondId) -> Result<()> {
        let c = self.conds.get(id.0).ok_or(Errno::EINVAL)?;
        if !c.waiters.is_empty() {
            return Err(Errno::EBUSY);
        }
        self.conds.remove(id.0);
        Ok(())
    }

    /// Atomically releases `mutex` and parks `me` on `id`.
    ///
    /// A deadline at or before `now` fails with `ETIMEDOUT` without
    /// releasing anything.
    pub fn cond_wait(
        &mut self,
        me: ThreadId,
        id: CondId,
        mutex: MutexId,
        deadline: Option<Instant>,
        now: Instant,
    ) -> Result<Step> {
        let c = self.conds.get(id.0).ok_or(Errno::EINVAL)?;
        if c.mutex.is_some_and(|bound| bound != mutex) {
            return Err(Errno::EINVAL);
        }
        let snapshot = self.mutex_snapshot(mutex).ok_or(Errno::EINVAL)?;
        if snapshot.owner != Some(me) {
            return Err(Errno::EPERM);
        }
        if deadline.is_some_and(|deadline| deadline <= now) {
            return Err(Errno::ETIMEDOUT);
        }
        let held = self.mutex_release(me, mutex);
        if let Some(c) = self.conds.get_mut(id.0) {
            c.mutex = Some(mutex);
            c.waiters.push_back(me);
        }
        self.park(me, ThreadState::CondWait, WaitSlot::Cond(id), deadline);
        if let Some(t) = self.tcb_mut(me) {
            t.cond_relock = Some((mutex, held));
        }
        Ok(Step::Blocked)
    }

    /// Re-acquires the mutex released by the last `cond_wait`, restoring
    /// its recursion count. Call again after every `Blocked`.
    pub fn cond_relock(&mut self, me: ThreadId) -> Result<Step> {
        let Some((mutex, held)) = self.tcb(me).and_then(|t| t.cond_relock) else {
            return Ok(Step::Done(()));
        };
        let owner = self.mutex_snapshot(mutex).ok_or(Errno::EINVAL)?.owner;
        if owner != Some(me) {
            if let Step::Blocked = self.mutex_lock(me, mutex)? {
                return Ok(Step::Blocked);
            }
        }
        self.mutex_set_count(mutex, held);
        if let Some(t) = self.tcb_mut(me) {
            t.cond_relock = None;
        }
        Ok(Step::Done(()))
    }

    /// Wakes the longest waiter. Returns whether one was woken.
    pub fn cond_signal(&mut self, id: CondId) -> Result<bool> {
        let c = self.conds.get_mut(id.0).ok_or(Errno::EINVAL)?;
        let next = c.waiters.pop_front();
        if c.waiters.is_empty() {
            c.mutex = None;
        }
        if let Some(next) = next {
            if let Some(t) = self.tcb_mut(next) {
                t.slot = WaitSlot::None;
            }
            self.make_ready(next, WakeReason::Notified);
        }
        Ok(next.is_some())
    }

    /// Wakes every waiter, oldest first. Returns how many were woken.
    pub fn cond_broadcast(&mut self, id: CondId) -> Result<usize> {
        let c = self.conds.get_mut(id.0).ok_or(Errno::EINVAL)?;
        c.mutex = None;
        let waiters = c.waiters.drain();
        for &waiter in &waiters {
            if let Some(t) = self.tcb_mut(waiter) {
                t.slot = WaitSlot::None;
            }
            self.make_ready(waiter, WakeReason::Notified);
        }
        Ok(waiters.len())
    }

    #[must_use]
    pub fn cond_waiters(&self, id: CondId) -> Vec<ThreadId> {
        self.conds
            .get(id.0)
            .map(|c| c.waiters.iter().collect())
            .unwrap_or_default()
    }
}
