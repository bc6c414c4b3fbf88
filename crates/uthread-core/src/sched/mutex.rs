//! Mutexes and priority inheritance.
//!
//! Waiters queue by active priority (FIFO within a priority). Unlock hands
//! ownership straight to the queue head, so a woken waiter never has to
//! retry. An owner's inherited priority is recomputed whenever one of its
//! mutexes gains or loses a waiter or changes hands.

use crate::arena::arena_handle;
use crate::errno::{Errno, Result};
use crate::queue::ThreadQueue;
use crate::tcb::{PRIO_MAX, ThreadId, ThreadState, WaitSlot, WakeReason};

use super::{Scheduler, Step};

arena_handle!(
    /// Handle of a mutex.
    MutexId,
    "m"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexKind {
    /// No recursion; relocking by the owner fails with `EDEADLK`.
    #[default]
    Normal,
    /// Counting mutex; the owner may lock it repeatedly.
    Recursive,
    ErrorCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexProtocol {
    #[default]
    None,
    /// The owner runs at least at the priority of its highest waiter.
    Inherit,
    /// The owner runs at least at the ceiling while holding the mutex.
    Protect(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutexAttr {
    pub kind: MutexKind,
    pub protocol: MutexProtocol,
}

#[derive(Debug, Clone)]
pub(crate) struct MutexState {
    kind: MutexKind,
    protocol: MutexProtocol,
    pub(crate) owner: Option<ThreadId>,
    count: u32,
    pub(crate) waiters: ThreadQueue,
}

impl MutexState {
    /// Keeps ownership only if `survivor` holds it; drops every waiter.
    pub(crate) fn retain_owner(&mut self, survivor: ThreadId) {
        self.waiters.clear();
        if self.owner != Some(survivor) {
            self.owner = None;
            self.count = 0;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexSnapshot {
    pub owner: Option<ThreadId>,
    pub count: u32,
    pub waiters: Vec<ThreadId>,
}

impl Scheduler {
    pub fn mutex_init(&mut self, attr: MutexAttr) -> Result<MutexId> {
        if let MutexProtocol::Protect(ceiling) = attr.protocol
            && ceiling > PRIO_MAX
        {
            return Err(Errno::EINVAL);
        }
        Ok(MutexId(self.mutexes.insert(MutexState {
            kind: attr.kind,
            protocol: attr.protocol,
            owner: None,
            count: 0,
            waiters: ThreadQueue::new(),
        })))
    }

    pub fn mutex_destroy(&mut self, id: MutexId) -> Result<()> {
        let m = self.mutexes.get(id.0).ok_or(Errno::EINVAL)?;
        if m.owner.is_some() || !m.waiters.is_empty() {
            return Err(Errno::EBUSY);
        }
        self.mutexes.remove(id.0);
        Ok(())
    }

    /// Locks `id` for `me`. When blocked, ownership has been handed over by
    /// the time `me` runs again.
    pub fn mutex_lock(&mut self, me: ThreadId, id: MutexId) -> Result<Step> {
        if self.try_acquire(me, id)? {
            return Ok(Step::Done(()));
        }
        let my_priority = self.tcb(me).map_or(0, |t| t.active_priority);
        let threads = &self.threads;
        let Some(m) = self.mutexes.get_mut(id.0) else {
            return Err(Errno::EINVAL);
        };
        m.waiters.insert_before(me, |queued| {
            threads
                .get(queued.0)
                .is_none_or(|t| t.active_priority < my_priority)
        });
        let owner = m.owner;
        self.park(me, ThreadState::MutexWait, WaitSlot::Mutex(id), None);
        if let Some(owner) = owner {
            self.refresh_priority(owner);
        }
        Ok(Step::Blocked)
    }

    pub fn mutex_trylock(&mut self, me: ThreadId, id: MutexId) -> Result<()> {
        match self.try_acquire(me, id) {
            Ok(true) => Ok(()),
            Ok(false) | Err(Errno::EDEADLK) => Err(Errno::EBUSY),
            Err(err) => Err(err),
        }
    }

    /// Ok(false) means another thread owns it.
    fn try_acquire(&mut self, me: ThreadId, id: MutexId) -> Result<bool> {
        let my_priority = self.live_tcb(me)?.active_priority;
        let m = self.mutexes.get_mut(id.0).ok_or(Errno::EINVAL)?;
        if let MutexProtocol::Protect(ceiling) = m.protocol
            && my_priority > ceiling
        {
            return Err(Errno::EINVAL);
        }
        match m.owner {
            None => {
                m.owner = Some(me);
                m.count = 1;
                if let Some(t) = self.threads.get_mut(me.0) {
                    t.owned_mutexes.push(id);
                }
                self.refresh_priority(me);
                Ok(true)
            }
            Some(owner) if owner == me => match m.kind {
                MutexKind::Recursive => {
                    m.count = m.count.checked_add(1).ok_or(Errno::EAGAIN)?;
                    Ok(true)
                }
                MutexKind::Normal | MutexKind::ErrorCheck => Err(Errno::EDEADLK),
            },
            Some(_) => Ok(false),
        }
    }

    pub fn mutex_unlock(&mut self, me: ThreadId, id: MutexId) -> Result<()> {
        let m = self.mutexes.get_mut(id.0).ok_or(Errno::EINVAL)?;
        if m.owner != Some(me) {
            return Err(Errno::EPERM);
        }
        if m.count > 1 {
            m.count -= 1;
            return Ok(());
        }
        self.mutex_release(me, id);
        Ok(())
    }

    /// Fully releases `id` held by `me` regardless of recursion count and
    /// hands it to the best waiter. Returns the count that was held.
    pub(crate) fn mutex_release(&mut self, me: ThreadId, id: MutexId) -> u32 {
        let Some(m) = self.mutexes.get_mut(id.0) else {
            return 0;
        };
        let held = std::mem::take(&mut m.count);
        m.owner = None;
        let next = m.waiters.pop_front();
        if let Some(next) = next {
            m.owner = Some(next);
            m.count = 1;
        }
        if let Some(t) = self.threads.get_mut(me.0) {
            t.owned_mutexes.retain(|&owned| owned != id);
        }
        if let Some(next) = next {
            if let Some(t) = self.threads.get_mut(next.0) {
                t.slot = WaitSlot::None;
                t.owned_mutexes.push(id);
            }
            self.make_ready(next, WakeReason::Granted);
            self.refresh_priority(next);
        }
        self.refresh_priority(me);
        held
    }

    /// Restores a recursion count after a condvar wait re-acquired `id`.
    pub(crate) fn mutex_set_count(&mut self, id: MutexId, count: u32) {
        if let Some(m) = self.mutexes.get_mut(id.0) {
            m.count = count.max(1);
        }
    }

    /// Changes a priority-ceiling mutex's ceiling; returns the old one.
    pub fn mutex_set_ceiling(&mut self, id: MutexId, ceiling: u8) -> Result<u8> {
        if ceiling > PRIO_MAX {
            return Err(Errno::EINVAL);
        }
        let m = self.mutexes.get_mut(id.0).ok_or(Errno::EINVAL)?;
        let MutexProtocol::Protect(old) = m.protocol else {
            return Err(Errno::EINVAL);
        };
        m.protocol = MutexProtocol::Protect(ceiling);
        if let Some(owner) = m.owner {
            self.refresh_priority(owner);
        }
        Ok(old)
    }

    #[must_use]
    pub fn mutex_snapshot(&self, id: MutexId) -> Option<MutexSnapshot> {
        let m = self.mutexes.get(id.0)?;
        Some(MutexSnapshot {
            owner: m.owner,
            count: m.count,
            waiters: m.waiters.iter().collect(),
        })
    }

    /// Priority a held mutex lends its owner.
    fn lent_priority(&self, id: MutexId) -> u8 {
        let Some(m) = self.mutexes.get(id.0) else {
            return 0;
        };
        match m.protocol {
            MutexProtocol::None => 0,
            MutexProtocol::Protect(ceiling) => ceiling,
            MutexProtocol::Inherit => m
                .waiters
                .iter()
                .filter_map(|w| self.tcb(w).map(|t| t.active_priority))
                .max()
                .unwrap_or(0),
        }
    }

    /// Recomputes `id`'s inherited and active priority, re-sorts whatever
    /// queue holds it, and follows the chain to the owner of the mutex it
    /// waits on.
    pub(crate) fn refresh_priority(&mut self, mut id: ThreadId) {
        for _ in 0..=self.threads.len() {
            let Some(t) = self.tcb(id) else {
                return;
            };
            let inherited = t
                .owned_mutexes
                .iter()
                .map(|&m| self.lent_priority(m))
                .max()
                .unwrap_or(0);
            let Some(t) = self.threads.get_mut(id.0) else {
                return;
            };
            t.inherited_priority = inherited;
            let active = t.base_priority.max(inherited);
            if active == t.active_priority {
                return;
            }
            t.active_priority = active;
            let slot = t.slot;
            match slot {
                WaitSlot::Ready => {
                    self.ready.remove(id);
                    self.ready.insert_tail(id, active);
                    return;
                }
                WaitSlot::Mutex(m) => {
                    let threads = &self.threads;
                    let Some(state) = self.mutexes.get_mut(m.0) else {
                        return;
                    };
                    state.waiters.remove(id);
                    state.waiters.insert_before(id, |queued| {
                        threads
                            .get(queued.0)
                            .is_none_or(|q| q.active_priority < active)
                    });
                    match (state.protocol, state.owner) {
                        (MutexProtocol::Inherit, Some(owner)) => id = owner,
                        _ => return,
                    }
                }
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::Relinquish;
    use super::*;

    #[test]
    fn counting_mutex_needs_matching_unlocks() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let m = s
            .mutex_init(MutexAttr {
                kind: MutexKind::Recursive,
                ..MutexAttr::default()
            })
            .unwrap();
        let other = spawn_prio(&mut s, 15);
        for _ in 0..3 {
            assert_eq!(s.mutex_lock(main, m), Ok(Step::Done(())));
        }
        s.relinquish(Relinquish::Yield, now);
        assert_eq!(run_next(&mut s, now), other);
        assert_eq!(s.mutex_trylock(other, m), Err(Errno::EBUSY));
        assert_eq!(s.mutex_unlock(other, m), Err(Errno::EPERM));
        assert_eq!(s.mutex_lock(other, m), Ok(Step::Blocked));
        assert_eq!(run_next(&mut s, now), main);
        s.mutex_unlock(main, m).unwrap();
        s.mutex_unlock(main, m).unwrap();
        assert_eq!(s.mutex_snapshot(m).unwrap().owner, Some(main));
        s.mutex_unlock(main, m).unwrap();
        let snap = s.mutex_snapshot(m).unwrap();
        assert_eq!((snap.owner, snap.count), (Some(other), 1));
        assert_eq!(s.tcb(other).unwrap().wake, WakeReason::Granted);
    }

    #[test]
    fn normal_mutex_self_relock_is_edeadlk() {
        let (mut s, _) = sched();
        let main = s.main_thread();
        let m = s.mutex_init(MutexAttr::default()).unwrap();
        assert_eq!(s.mutex_lock(main, m), Ok(Step::Done(())));
        assert_eq!(s.mutex_lock(main, m), Err(Errno::EDEADLK));
        assert_eq!(s.mutex_trylock(main, m), Err(Errno::EBUSY));
        assert_eq!(s.mutex_destroy(m), Err(Errno::EBUSY));
        s.mutex_unlock(main, m).unwrap();
        assert_eq!(s.mutex_unlock(main, m), Err(Errno::EPERM));
        s.mutex_destroy(m).unwrap();
        assert_eq!(s.mutex_lock(main, m), Err(Errno::EINVAL), "stale handle");
    }

    #[test]
    fn unlock_hands_off_to_highest_priority_waiter() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let m = s.mutex_init(MutexAttr::default()).unwrap();
        s.mutex_lock(main, m).unwrap();
        let low = spawn_prio(&mut s, 16);
        let high = spawn_prio(&mut s, 20);
        assert_eq!(run_next(&mut s, now), high);
        assert_eq!(s.mutex_lock(high, m), Ok(Step::Blocked));
        assert_eq!(run_next(&mut s, now), low);
        assert_eq!(s.mutex_lock(low, m), Ok(Step::Blocked));
        assert_eq!(run_next(&mut s, now), main);
        assert_eq!(s.mutex_snapshot(m).unwrap().waiters, vec![high, low]);
        s.mutex_unlock(main, m).unwrap();
        assert_eq!(s.mutex_snapshot(m).unwrap().owner, Some(high));
        assert_eq!(run_next(&mut s, now), high);
    }

    #[test]
    fn inheritance_boosts_and_restores_owner() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let m = s
            .mutex_init(MutexAttr {
                protocol: MutexProtocol::Inherit,
                ..MutexAttr::default()
            })
            .unwrap();
        s.mutex_lock(main, m).unwrap();
        let high = spawn_prio(&mut s, 25);
        assert_eq!(run_next(&mut s, now), high);
        assert_eq!(s.mutex_lock(high, m), Ok(Step::Blocked));
        assert_eq!(run_next(&mut s, now), main);
        let t = s.tcb(main).unwrap();
        assert_eq!((t.base_priority, t.inherited_priority, t.active_priority), (15, 25, 25));
        s.mutex_unlock(main, m).unwrap();
        let t = s.tcb(main).unwrap();
        assert_eq!((t.inherited_priority, t.active_priority), (0, 15));
        assert_eq!(s.tcb(high).unwrap().owned_mutexes, vec![m]);
    }

    #[test]
    fn inheritance_follows_a_chain() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let pi = MutexAttr {
            protocol: MutexProtocol::Inherit,
            ..MutexAttr::default()
        };
        let outer = s.mutex_init(pi).unwrap();
        let inner = s.mutex_init(pi).unwrap();
        s.mutex_lock(main, inner).unwrap();
        let mid = spawn_prio(&mut s, 18);
        assert_eq!(run_next(&mut s, now), mid);
        s.mutex_lock(mid, outer).unwrap();
        assert_eq!(s.mutex_lock(mid, inner), Ok(Step::Blocked));
        let top = spawn_prio(&mut s, 28);
        assert_eq!(run_next(&mut s, now), top);
        assert_eq!(s.mutex_lock(top, outer), Ok(Step::Blocked));
        assert_eq!(s.tcb(mid).unwrap().active_priority, 28);
        assert_eq!(s.tcb(main).unwrap().active_priority, 28);
        s.assert_invariants();
    }

    #[test]
    fn ceiling_raises_owner_and_rejects_higher_lockers() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let m = s
            .mutex_init(MutexAttr {
                protocol: MutexProtocol::Protect(20),
                ..MutexAttr::default()
            })
            .unwrap();
        s.mutex_lock(main, m).unwrap();
        assert_eq!(s.tcb(main).unwrap().active_priority, 20);
        assert_eq!(s.mutex_set_ceiling(m, 22), Ok(20));
        assert_eq!(s.tcb(main).unwrap().active_priority, 22);
        s.mutex_unlock(main, m).unwrap();
        let high = spawn_prio(&mut s, 30);
        assert_eq!(run_next(&mut s, now), high);
        assert_eq!(s.mutex_lock(high, m), Err(Errno::EINVAL));
        assert_eq!(
            s.mutex_init(MutexAttr {
                protocol: MutexProtocol::Protect(64),
                ..MutexAttr::default()
            }),
            Err(Errno::EINVAL)
        );
    }
}
