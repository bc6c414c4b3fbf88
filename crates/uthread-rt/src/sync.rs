//! Mutexes, condition variables, read-write locks and semaphores.
//!
//! The handles are plain ids into the runtime's scheduler and are `Copy`;
//! using one after `destroy`, or from another runtime, fails with
//! `EINVAL`.

use std::time::Instant;

use uthread_core::{
    CondId, Errno, MutexAttr, MutexId, Result, RwLockId, SemId, Step, ThreadId, WakeReason,
    cond_wait_result,
};

use crate::runtime::{CANCEL_NOW, Guard, Shared, with_runtime};

impl Shared {
    pub(crate) fn mutex_lock(&self, g: &mut Guard<'_>, me: ThreadId, id: MutexId) -> Result<()> {
        loop {
            match g.sched.mutex_lock(me, id)? {
                Step::Done(()) => return Ok(()),
                Step::Blocked => {
                    if self.block(g, me) == WakeReason::Granted {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Waits on `cond`, re-acquiring `mutex` before returning on every
    /// path, cancellation included.
    pub(crate) fn cond_wait(
        &self,
        g: &mut Guard<'_>,
        me: ThreadId,
        cond: CondId,
        mutex: MutexId,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if g.sched.take_cancel(me) {
            return Err(CANCEL_NOW);
        }
        let woke = match g.sched.cond_wait(me, cond, mutex, deadline, Instant::now())? {
            Step::Done(()) => WakeReason::Timeout,
            Step::Blocked => self.block(g, me),
        };
        loop {
            match g.sched.cond_relock(me)? {
                Step::Done(()) => break,
                Step::Blocked => {
                    let _ = self.block(g, me);
                }
            }
        }
        if woke == WakeReason::Canceled || g.sched.take_cancel(me) {
            return Err(CANCEL_NOW);
        }
        cond_wait_result(woke)
    }
}

/// A mutual-exclusion lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mutex {
    id: MutexId,
}

impl Mutex {
    pub fn new(attr: MutexAttr) -> Result<Self> {
        with_runtime(|_, g, _| g.sched.mutex_init(attr).map(|id| Mutex { id }))
    }

    #[must_use]
    pub fn id(self) -> MutexId {
        self.id
    }

    /// Blocks until the lock is held. Not interruptible by signals.
    pub fn lock(self) -> Result<()> {
        with_runtime(|shared, g, me| shared.mutex_lock(g, me, self.id))
    }

    pub fn try_lock(self) -> Result<()> {
        with_runtime(|_, g, me| g.sched.mutex_trylock(me, self.id))
    }

    pub fn unlock(self) -> Result<()> {
        with_runtime(|_, g, me| g.sched.mutex_unlock(me, self.id))
    }

    /// Changes the priority ceiling; returns the old one.
    pub fn set_ceiling(self, ceiling: u8) -> Result<u8> {
        with_runtime(|_, g, _| g.sched.mutex_set_ceiling(self.id, ceiling))
    }

    pub fn destroy(self) -> Result<()> {
        with_runtime(|_, g, _| g.sched.mutex_destroy(self.id))
    }
}

/// A condition variable, always used with one [`Mutex`] at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cond {
    id: CondId,
}

impl Cond {
    pub fn new() -> Result<Self> {
        with_runtime(|_, g, _| Ok(Cond { id: g.sched.cond_init() }))
    }

    #[must_use]
    pub fn id(self) -> CondId {
        self.id
    }

    /// Releases `mutex`, waits, and re-acquires it. May wake spuriously
    /// (`Ok`) when a signal handler ran; callers re-check their predicate.
    pub fn wait(self, mutex: Mutex) -> Result<()> {
        with_runtime(|shared, g, me| shared.cond_wait(g, me, self.id, mutex.id, None))
    }

    /// Like [`wait`](Self::wait) but fails with `ETIMEDOUT` once `deadline`
    /// passes.
    pub fn timed_wait(self, mutex: Mutex, deadline: Instant) -> Result<()> {
        with_runtime(|shared, g, me| shared.cond_wait(g, me, self.id, mutex.id, Some(deadline)))
    }

    /// Wakes the longest waiter; returns whether there was one.
    pub fn signal(self) -> Result<bool> {
        with_runtime(|_, g, _| g.sched.cond_signal(self.id))
    }

    /// Wakes every waiter; returns how many.
    pub fn broadcast(self) -> Result<usize> {
        with_runtime(|_, g, _| g.sched.cond_broadcast(self.id))
    }

    pub fn destroy(self) -> Result<()> {
        with_runtime(|_, g, _| g.sched.cond_destroy(self.id))
    }
}

/// A read-write lock that prefers writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RwLock {
    id: RwLockId,
}

impl RwLock {
    pub fn new() -> Result<Self> {
        with_runtime(|_, g, _| Ok(RwLock { id: g.sched.rwlock_init() }))
    }

    #[must_use]
    pub fn id(self) -> RwLockId {
        self.id
    }

    pub fn read(self) -> Result<()> {
        with_runtime(|shared, g, me| loop {
            match g.sched.rwlock_rdlock(me, self.id)? {
                Step::Done(()) => return Ok(()),
                Step::Blocked => {
                    if shared.block(g, me) == WakeReason::Granted {
                        return Ok(());
                    }
                }
            }
        })
    }

    pub fn try_read(self) -> Result<()> {
        with_runtime(|_, g, me| g.sched.rwlock_tryrdlock(me, self.id))
    }

    pub fn write(self) -> Result<()> {
        with_runtime(|shared, g, me| loop {
            match g.sched.rwlock_wrlock(me, self.id)? {
                Step::Done(()) => return Ok(()),
                Step::Blocked => {
                    if shared.block(g, me) == WakeReason::Granted {
                        return Ok(());
                    }
                }
            }
        })
    }

    pub fn try_write(self) -> Result<()> {
        with_runtime(|_, g, me| g.sched.rwlock_trywrlock(me, self.id))
    }

    /// Releases a read or write hold.
    pub fn unlock(self) -> Result<()> {
        with_runtime(|_, g, me| g.sched.rwlock_unlock(me, self.id))
    }

    pub fn destroy(self) -> Result<()> {
        with_runtime(|_, g, _| g.sched.rwlock_destroy(self.id))
    }
}

/// A counting semaphore private to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Semaphore {
    id: SemId,
}

impl Semaphore {
    /// Process-shared semaphores are not supported (`ENOSYS`).
    pub fn new(pshared: bool, value: u32) -> Result<Self> {
        with_runtime(|_, g, _| g.sched.sem_init(pshared, value).map(|id| Semaphore { id }))
    }

    #[must_use]
    pub fn id(self) -> SemId {
        self.id
    }

    /// Takes one unit, waiting while the count is zero. A cancellation
    /// point; fails with `EINTR` when a handler interrupts it.
    pub fn wait(self) -> Result<()> {
        self.wait_until(None)
    }

    pub fn timed_wait(self, deadline: Instant) -> Result<()> {
        self.wait_until(Some(deadline))
    }

    fn wait_until(self, deadline: Option<Instant>) -> Result<()> {
        with_runtime(|shared, g, me| loop {
            if g.sched.take_cancel(me) {
                return Err(CANCEL_NOW);
            }
            match g.sched.sem_wait(me, self.id, deadline, Instant::now())? {
                Step::Done(()) => return Ok(()),
                Step::Blocked => match shared.block(g, me) {
                    WakeReason::Timeout => return Err(Errno::ETIMEDOUT),
                    WakeReason::Interrupted(_) => return Err(Errno::EINTR),
                    WakeReason::Canceled => return Err(CANCEL_NOW),
                    _ => {}
                },
            }
        })
    }

    pub fn try_wait(self) -> Result<()> {
        with_runtime(|_, g, _| g.sched.sem_trywait(self.id))
    }

    pub fn post(self) -> Result<()> {
        with_runtime(|_, g, _| g.sched.sem_post(self.id))
    }

    pub fn value(self) -> Result<u32> {
        with_runtime(|_, g, _| g.sched.sem_getvalue(self.id))
    }

    pub fn destroy(self) -> Result<()> {
        with_runtime(|_, g, _| g.sched.sem_destroy(self.id))
    }
}
