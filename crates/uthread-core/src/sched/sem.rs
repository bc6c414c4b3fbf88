//! Counting semaphores.
//!
//! `post` wakes every waiter and lets them race for the count in priority
//! order; a waiter that finds the count taken simply parks again. Waits are
//! cancellation points and report signal interruption as `EINTR`.

use std::time::Instant;

use crate::arena::arena_handle;
use crate::errno::{Errno, Result};
use crate::queue::ThreadQueue;
use crate::tcb::{ThreadId, ThreadState, WaitSlot, WakeReason};

use super::{Scheduler, Step};

arena_handle!(
    /// Handle of a semaphore.
    SemId,
    "s"
);

pub const SEM_VALUE_MAX: u32 = i32::MAX as u32;

#[derive(Debug, Clone, Default)]
pub(crate) struct SemState {
    value: u32,
    pub(crate) waiters: ThreadQueue,
}

impl Scheduler {
    /// Process-shared semaphores are not supported (`ENOSYS`).
    pub fn sem_init(&mut self, pshared: bool, value: u32) -> Result<SemId> {
        if pshared {
            return Err(Errno::ENOSYS);
        }
        if value > SEM_VALUE_MAX {
            return Err(Errno::EINVAL);
        }
        Ok(SemId(self.sems.insert(SemState {
            value,
            waiters: ThreadQueue::new(),
        })))
    }

    pub fn sem_destroy(&mut self, id: SemId) -> Result<()> {
        let sem = self.sems.get(id.0).ok_or(Errno::EINVAL)?;
        if !sem.waiters.is_empty() {
            return Err(Errno::EBUSY);
        }
        self.sems.remove(id.0);
        Ok(())
    }

    /// Takes one unit or parks. Re-issue after every wake that is not a
    /// timeout, interruption or cancellation.
    pub fn sem_wait(
        &mut self,
        me: ThreadId,
        id: SemId,
        deadline: Option<Instant>,
        now: Instant,
    ) -> Result<Step> {
        let sem = self.sems.get_mut(id.0).ok_or(Errno::EINVAL)?;
        if sem.value > 0 {
            sem.value -= 1;
            return Ok(Step::Done(()));
        }
        if deadline.is_some_and(|deadline| deadline <= now) {
            return Err(Errno::ETIMEDOUT);
        }
        sem.waiters.push_back(me);
        self.park(me, ThreadState::SemWait, WaitSlot::Sem(id), deadline);
        Ok(Step::Blocked)
    }

    pub fn sem_trywait(&mut self, id: SemId) -> Result<()> {
        let sem = self.sems.get_mut(id.0).ok_or(Errno::EINVAL)?;
        if sem.value == 0 {
            return Err(Errno::EAGAIN);
        }
        sem.value -= 1;
        Ok(())
    }

    pub fn sem_post(&mut self, id: SemId) -> Result<()> {
        let sem = self.sems.get_mut(id.0).ok_or(Errno::EINVAL)?;
        if sem.value >= SEM_VALUE_MAX {
            return Err(Errno::EOVERFLOW);
        }
        sem.value += 1;
        for waiter in sem.waiters.drain() {
            if let Some(t) = self.threads.get_mut(waiter.0) {
                t.slot = WaitSlot::None;
            }
            self.make_ready(waiter, WakeReason::Notified);
        }
        Ok(())
    }

    pub fn sem_getvalue(&self, id: SemId) -> Result<u32> {
        self.sems.get(id.0).map(|sem| sem.value).ok_or(Errno::EINVAL)
    }

    #[must_use]
    pub fn sem_waiters(&self, id: SemId) -> usize {
        self.sems.get(id.0).map_or(0, |sem| sem.waiters.len())
    }
}
