//! State reset in a forked child.
//!
//! Only the thread that called `fork` exists in the child. Every other TCB
//! is dropped without becoming joinable, all wait queues are emptied, and
//! locks keep an owner only when that owner is the survivor.

use crate::signal::SigSet;
use crate::tcb::{ThreadId, ThreadState, WaitSlot};

use super::Scheduler;

impl Scheduler {
    pub fn reset_after_fork(&mut self, survivor: ThreadId) {
        if self.threads.get(survivor.0).is_none() {
            self.violation(format_args!("fork survivor {survivor} does not exist"));
        }

        self.threads.retain(|slot, _| slot == survivor.0);
        self.all.clear();
        self.all.push_back(survivor);
        self.dead.clear();
        self.ready.clear();
        self.timeouts.clear();
        self.io_waiters.clear();
        self.signal_waiters.clear();
        self.child_waiters.clear();
        self.spinners.clear();
        self.process_pending = SigSet::EMPTY;

        for (_, m) in self.mutexes.iter_mut() {
            m.retain_owner(survivor);
        }
        for (_, c) in self.conds.iter_mut() {
            c.waiters.clear();
            c.mutex = None;
        }
        for (_, rw) in self.rwlocks.iter_mut() {
            rw.retain_owner(survivor);
        }
        for (_, sem) in self.sems.iter_mut() {
            sem.waiters.clear();
        }
        for entry in self.fds.values_mut() {
            entry.retain_owner(survivor);
        }

        let mutexes = &self.mutexes;
        if let Some(t) = self.threads.get_mut(survivor.0) {
            t.state = ThreadState::Running;
            t.slot = WaitSlot::None;
            t.wake_deadline = None;
            t.slice_deadline = None;
            t.sig_pending = SigSet::EMPTY;
            t.join_waiters.clear();
            t.owned_mutexes.retain(|&m| mutexes.get(m.0).is_some());
        }
        self.main = survivor;
        self.current = Some(survivor);
        self.refresh_priority(survivor);
    }
}

#[cfg(test)]
mod tests {
    use super::super::fdlock::FdDirection;
    use super::super::mutex::{MutexAttr, MutexProtocol};
    use super::super::test_support::*;
    use super::super::{Dispatch, Step};
    use super::*;
    use crate::errno::Errno;
    use std::time::Duration;

    #[test]
    fn child_keeps_only_the_forking_thread() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let m_held = s.mutex_init(MutexAttr::default()).unwrap();
        let m_other = s
            .mutex_init(MutexAttr {
                protocol: MutexProtocol::Inherit,
                ..MutexAttr::default()
            })
            .unwrap();
        let sem = s.sem_init(false, 0).unwrap();
        let other = spawn_prio(&mut s, 20);
        let waiter = spawn_prio(&mut s, 25);
        let forker = spawn_prio(&mut s, 10);

        assert_eq!(run_next(&mut s, now), waiter);
        assert_eq!(s.sem_wait(waiter, sem, None, now), Ok(Step::Blocked));
        assert_eq!(run_next(&mut s, now), other);
        s.mutex_lock(other, m_other).unwrap();
        s.fd_lock(other, 3, FdDirection::Write, None, now).unwrap();
        let _ = s.sleep_until(other, now + Duration::from_secs(30), now);
        assert_eq!(run_next(&mut s, now), main);
        let _ = s.sleep_until(main, now + Duration::from_secs(30), now);
        assert_eq!(run_next(&mut s, now), forker);
        s.mutex_lock(forker, m_held).unwrap();
        assert_eq!(s.mutex_lock(forker, m_other), Ok(Step::Blocked));
        assert_eq!(s.tcb(other).unwrap().active_priority, 20);

        s.reset_after_fork(forker);
        s.assert_invariants();
        assert_eq!(s.live_threads(), vec![forker]);
        assert_eq!(s.main_thread(), forker);
        assert_eq!(s.current(), Some(forker));
        assert!(s.tcb(other).is_none() && s.tcb(waiter).is_none());
        assert_eq!(s.mutex_snapshot(m_held).unwrap().owner, Some(forker));
        assert_eq!(s.mutex_snapshot(m_other).unwrap().owner, None);
        assert_eq!(s.sem_waiters(sem), 0);
        assert_eq!(s.fd_snapshot(3).unwrap().write_owner, None);
        assert!(s.next_deadline().is_none());
        assert_eq!(s.tcb(forker).unwrap().state, ThreadState::Running);
        assert_eq!(s.mutex_lock(forker, m_other), Ok(Step::Done(())));
        s.exit_current(0);
        assert_eq!(s.dispatch(now), Dispatch::Exhausted);
    }

    #[test]
    fn child_keeps_only_its_own_read_holds() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let a = s.rwlock_init();
        let b = s.rwlock_init();
        s.rwlock_rdlock(main, a).unwrap();
        let other = spawn_prio(&mut s, 20);
        assert_eq!(run_next(&mut s, now), other);
        s.rwlock_rdlock(other, a).unwrap();
        s.rwlock_rdlock(other, a).unwrap();
        s.rwlock_rdlock(other, b).unwrap();
        let _ = s.sleep_until(other, now + Duration::from_secs(30), now);
        assert_eq!(run_next(&mut s, now), main);

        s.reset_after_fork(main);
        s.assert_invariants();
        let snap = s.rwlock_snapshot(a).unwrap();
        assert_eq!((snap.state, snap.readers), (1, vec![(main, 1)]));
        let snap = s.rwlock_snapshot(b).unwrap();
        assert_eq!((snap.state, snap.readers), (0, vec![]));
        assert_eq!(s.rwlock_unlock(main, b), Err(Errno::EPERM));
        s.rwlock_unlock(main, a).unwrap();
        s.rwlock_trywrlock(main, b).unwrap();
    }
}
