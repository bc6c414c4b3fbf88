//! Read-write locks with writer preference.
//!
//! `state` is 0 when free, N with N readers, -1 with a writer. Each lock
//! records how many read holds every reader has on it, so only a holder can
//! release a read hold. New readers wait behind blocked writers unless they
//! already hold a read lock on the same rwlock, which keeps recursive readers
//! from deadlocking against a queued writer. Releases hand the lock directly
//! to the waiters they unblock.

use std::collections::HashMap;

use crate::arena::arena_handle;
use crate::errno::{Errno, Result};
use crate::queue::ThreadQueue;
use crate::tcb::{ThreadId, ThreadState, WaitSlot, WakeReason};

use super::{Scheduler, Step};

arena_handle!(
    /// Handle of a read-write lock.
    RwLockId,
    "rw"
);

const MAX_READ_LOCKS: i64 = i32::MAX as i64 - 1;

#[derive(Debug, Clone, Default)]
pub(crate) struct RwLockState {
    state: i64,
    writer: Option<ThreadId>,
    /// Read holds per reader; sums to `state` while readers hold the lock.
    readers: HashMap<ThreadId, u32>,
    pub(crate) blocked_writers: u32,
    pub(crate) read_waiters: ThreadQueue,
    pub(crate) write_waiters: ThreadQueue,
}

impl RwLockState {
    /// Keeps only the holds `survivor` has on this lock and drops every
    /// waiter.
    pub(crate) fn retain_owner(&mut self, survivor: ThreadId) {
        self.read_waiters.clear();
        self.write_waiters.clear();
        self.blocked_writers = 0;
        self.readers.retain(|&id, _| id == survivor);
        if self.state < 0 {
            if self.writer != Some(survivor) {
                self.state = 0;
                self.writer = None;
            }
        } else {
            self.state = i64::from(self.reads_held(survivor));
        }
    }

    pub(crate) fn reads_held(&self, id: ThreadId) -> u32 {
        self.readers.get(&id).copied().unwrap_or(0)
    }

    pub(crate) fn holds_match_state(&self) -> bool {
        let reads: i64 = self.readers.values().map(|&n| i64::from(n)).sum();
        if self.state < 0 {
            reads == 0 && self.writer.is_some()
        } else {
            reads == self.state && self.writer.is_none()
        }
    }

    fn add_reader(&mut self, id: ThreadId) {
        self.state += 1;
        *self.readers.entry(id).or_default() += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RwLockSnapshot {
    pub state: i64,
    pub writer: Option<ThreadId>,
    /// Readers and their hold counts, ordered by thread id.
    pub readers: Vec<(ThreadId, u32)>,
    pub blocked_writers: u32,
    pub read_waiters: Vec<ThreadId>,
    pub write_waiters: Vec<ThreadId>,
}

impl Scheduler {
    pub fn rwlock_init(&mut self) -> RwLockId {
        RwLockId(self.rwlocks.insert(RwLockState::default()))
    }

    pub fn rwlock_destroy(&mut self, id: RwLockId) -> Result<()> {
        let rw = self.rwlocks.get(id.0).ok_or(Errno::EINVAL)?;
        if rw.state != 0 || !rw.read_waiters.is_empty() || !rw.write_waiters.is_empty() {
            return Err(Errno::EBUSY);
        }
        self.rwlocks.remove(id.0);
        Ok(())
    }

    /// Ok(false): must wait.
    fn try_read(&mut self, me: ThreadId, id: RwLockId) -> Result<bool> {
        self.live_tcb(me)?;
        let rw = self.rwlocks.get_mut(id.0).ok_or(Errno::EINVAL)?;
        if rw.writer == Some(me) {
            return Err(Errno::EDEADLK);
        }
        if rw.state < 0 || (rw.blocked_writers > 0 && rw.reads_held(me) == 0) {
            return Ok(false);
        }
        if rw.state >= MAX_READ_LOCKS {
            return Err(Errno::EAGAIN);
        }
        rw.add_reader(me);
        Ok(true)
    }

    pub fn rwlock_rdlock(&mut self, me: ThreadId, id: RwLockId) -> Result<Step> {
        if self.try_read(me, id)? {
            return Ok(Step::Done(()));
        }
        if let Some(rw) = self.rwlocks.get_mut(id.0) {
            rw.read_waiters.push_back(me);
        }
        self.park(me, ThreadState::RwLockWait, WaitSlot::RwRead(id), None);
        Ok(Step::Blocked)
    }

    pub fn rwlock_tryrdlock(&mut self, me: ThreadId, id: RwLockId) -> Result<()> {
        if self.try_read(me, id)? {
            Ok(())
        } else {
            Err(Errno::EBUSY)
        }
    }

    fn try_write(&mut self, me: ThreadId, id: RwLockId) -> Result<bool> {
        self.live_tcb(me)?;
        let rw = self.rwlocks.get_mut(id.0).ok_or(Errno::EINVAL)?;
        if rw.writer == Some(me) {
            return Err(Errno::EDEADLK);
        }
        if rw.state != 0 {
            return Ok(false);
        }
        rw.state = -1;
        rw.writer = Some(me);
        Ok(true)
    }

    pub fn rwlock_wrlock(&mut self, me: ThreadId, id: RwLockId) -> Result<Step> {
        if self.try_write(me, id)? {
            return Ok(Step::Done(()));
        }
        if let Some(rw) = self.rwlocks.get_mut(id.0) {
            rw.blocked_writers += 1;
            rw.write_waiters.push_back(me);
        }
        self.park(me, ThreadState::RwLockWait, WaitSlot::RwWrite(id), None);
        Ok(Step::Blocked)
    }

    pub fn rwlock_trywrlock(&mut self, me: ThreadId, id: RwLockId) -> Result<()> {
        match self.try_write(me, id) {
            Ok(true) => Ok(()),
            Ok(false) | Err(Errno::EDEADLK) => Err(Errno::EBUSY),
            Err(err) => Err(err),
        }
    }

    pub fn rwlock_unlock(&mut self, me: ThreadId, id: RwLockId) -> Result<()> {
        self.live_tcb(me)?;
        let rw = self.rwlocks.get_mut(id.0).ok_or(Errno::EINVAL)?;
        match rw.state {
            0 => return Err(Errno::EPERM),
            -1 => {
                if rw.writer != Some(me) {
                    return Err(Errno::EPERM);
                }
                rw.state = 0;
                rw.writer = None;
            }
            _ => {
                let Some(held) = rw.readers.get_mut(&me) else {
                    return Err(Errno::EPERM);
                };
                *held -= 1;
                if *held == 0 {
                    rw.readers.remove(&me);
                }
                rw.state -= 1;
            }
        }
        self.rwlock_grant(id);
        Ok(())
    }

    /// Hands a free lock to the next writer, or to every queued reader
    /// when no writer waits.
    pub(crate) fn rwlock_grant(&mut self, id: RwLockId) {
        let Some(rw) = self.rwlocks.get_mut(id.0) else {
            return;
        };
        if rw.state != 0 && !(rw.state > 0 && rw.blocked_writers == 0) {
            return;
        }
        let granted: Vec<ThreadId> = if rw.state == 0
            && let Some(writer) = rw.write_waiters.pop_front()
        {
            rw.blocked_writers -= 1;
            rw.state = -1;
            rw.writer = Some(writer);
            vec![writer]
        } else if rw.blocked_writers == 0 {
            let readers = rw.read_waiters.drain();
            for &reader in &readers {
                rw.add_reader(reader);
            }
            readers
        } else {
            Vec::new()
        };
        for id in granted {
            if let Some(t) = self.threads.get_mut(id.0) {
                t.slot = WaitSlot::None;
            }
            self.make_ready(id, WakeReason::Granted);
        }
    }

    #[must_use]
    pub fn rwlock_snapshot(&self, id: RwLockId) -> Option<RwLockSnapshot> {
        let rw = self.rwlocks.get(id.0)?;
        let mut readers: Vec<(ThreadId, u32)> =
            rw.readers.iter().map(|(&id, &n)| (id, n)).collect();
        readers.sort_unstable();
        Some(RwLockSnapshot {
            state: rw.state,
            writer: rw.writer,
            readers,
            blocked_writers: rw.blocked_writers,
            read_waiters: rw.read_waiters.iter().collect(),
            write_waiters: rw.write_waiters.iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn writer_waits_for_readers_and_blocks_new_readers() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let rw = s.rwlock_init();
        assert_eq!(s.rwlock_rdlock(main, rw), Ok(Step::Done(())));
        let writer = spawn_prio(&mut s, 20);
        let reader = spawn_prio(&mut s, 18);
        assert_eq!(run_next(&mut s, now), writer);
        assert_eq!(s.rwlock_wrlock(writer, rw), Ok(Step::Blocked));
        assert_eq!(run_next(&mut s, now), reader);
        assert_eq!(s.rwlock_tryrdlock(reader, rw), Err(Errno::EBUSY));
        assert_eq!(s.rwlock_rdlock(reader, rw), Ok(Step::Blocked));
        assert_eq!(run_next(&mut s, now), main);

        // A reader that already holds the lock may recurse past the writer.
        assert_eq!(s.rwlock_rdlock(main, rw), Ok(Step::Done(())));
        s.rwlock_unlock(main, rw).unwrap();
        s.rwlock_unlock(main, rw).unwrap();

        let snap = s.rwlock_snapshot(rw).unwrap();
        assert_eq!((snap.state, snap.writer), (-1, Some(writer)));
        assert_eq!(snap.read_waiters, vec![reader]);
        assert_eq!(run_next(&mut s, now), writer);
        s.rwlock_unlock(writer, rw).unwrap();
        let snap = s.rwlock_snapshot(rw).unwrap();
        assert_eq!(snap.state, 1, "queued reader granted");
        assert_eq!(snap.readers, vec![(reader, 1)]);
    }

    #[test]
    fn usage_errors() {
        let (mut s, _) = sched();
        let main = s.main_thread();
        let rw = s.rwlock_init();
        assert_eq!(s.rwlock_unlock(main, rw), Err(Errno::EPERM));
        s.rwlock_wrlock(main, rw).unwrap();
        assert_eq!(s.rwlock_wrlock(main, rw), Err(Errno::EDEADLK));
        assert_eq!(s.rwlock_rdlock(main, rw), Err(Errno::EDEADLK));
        assert_eq!(s.rwlock_trywrlock(main, rw), Err(Errno::EBUSY));
        assert_eq!(s.rwlock_destroy(rw), Err(Errno::EBUSY));
        s.rwlock_unlock(main, rw).unwrap();
        s.rwlock_destroy(rw).unwrap();
        assert_eq!(s.rwlock_tryrdlock(main, rw), Err(Errno::EINVAL));
    }

    #[test]
    fn readers_share_and_last_reader_admits_writer() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let rw = s.rwlock_init();
        let other = spawn_prio(&mut s, 20);
        assert_eq!(run_next(&mut s, now), other);
        s.rwlock_rdlock(other, rw).unwrap();
        let _ = s.sleep_until(other, now + std::time::Duration::from_secs(60), now);
        assert_eq!(run_next(&mut s, now), main);
        s.rwlock_tryrdlock(main, rw).unwrap();
        assert_eq!(s.rwlock_snapshot(rw).unwrap().state, 2);
        s.rwlock_unlock(main, rw).unwrap();
        assert_eq!(s.rwlock_trywrlock(main, rw), Err(Errno::EBUSY));
        assert_eq!(s.rwlock_wrlock(main, rw), Ok(Step::Blocked));
        s.wake(other, WakeReason::Timeout);
        assert_eq!(run_next(&mut s, now), other);
        s.rwlock_unlock(other, rw).unwrap();
        assert_eq!(s.rwlock_snapshot(rw).unwrap().writer, Some(main));
        assert_eq!(s.tcb(main).unwrap().wake, WakeReason::Granted);
    }

    #[test]
    fn read_hold_on_one_lock_does_not_release_another() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let a = s.rwlock_init();
        let b = s.rwlock_init();
        s.rwlock_rdlock(main, a).unwrap();
        let other = spawn_prio(&mut s, 20);
        assert_eq!(run_next(&mut s, now), other);
        s.rwlock_rdlock(other, b).unwrap();
        let _ = s.sleep_until(other, now + std::time::Duration::from_secs(60), now);
        assert_eq!(run_next(&mut s, now), main);

        assert_eq!(s.rwlock_unlock(main, b), Err(Errno::EPERM));
        let snap = s.rwlock_snapshot(b).unwrap();
        assert_eq!((snap.state, snap.readers), (1, vec![(other, 1)]));
        assert_eq!(s.rwlock_trywrlock(main, b), Err(Errno::EBUSY));
        s.rwlock_unlock(main, a).unwrap();
        assert_eq!(s.rwlock_unlock(main, a), Err(Errno::EPERM));
    }

    #[test]
    fn queued_writer_stops_readers_holding_only_other_locks() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let a = s.rwlock_init();
        let b = s.rwlock_init();
        s.rwlock_rdlock(main, a).unwrap();
        s.rwlock_rdlock(main, b).unwrap();
        let other = spawn_prio(&mut s, 20);
        let writer = spawn_prio(&mut s, 18);
        assert_eq!(run_next(&mut s, now), other);
        s.rwlock_rdlock(other, a).unwrap();
        let _ = s.sleep_until(other, now + std::time::Duration::from_secs(60), now);
        assert_eq!(run_next(&mut s, now), writer);
        assert_eq!(s.rwlock_wrlock(writer, a), Ok(Step::Blocked));
        assert_eq!(run_next(&mut s, now), main);

        // main reads b, not a: the queued writer on a still wins.
        s.rwlock_unlock(main, a).unwrap();
        assert_eq!(s.rwlock_tryrdlock(main, a), Err(Errno::EBUSY));
        assert_eq!(s.rwlock_rdlock(main, a), Ok(Step::Blocked));
        assert_eq!(s.tcb(main).unwrap().state, ThreadState::RwLockWait);
        let snap = s.rwlock_snapshot(a).unwrap();
        assert_eq!((snap.state, snap.readers), (1, vec![(other, 1)]));
        assert_eq!(snap.write_waiters, vec![writer]);
        assert_eq!(snap.read_waiters, vec![main]);
        assert_eq!(s.rwlock_snapshot(b).unwrap().readers, vec![(main, 1)]);
    }
}
