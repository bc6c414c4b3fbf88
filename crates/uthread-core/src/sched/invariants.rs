//! Structural self-check.
//!
//! Verifies that every thread sits in exactly the structure its slot
//! names, that the ready queue only holds runnable threads at their active
//! priority, and that priorities are consistent. Run after every dispatch
//! in hardened mode and throughout the tests.

use std::collections::HashMap;

use crate::tcb::{ThreadId, ThreadState, WaitSlot};

use super::Scheduler;
use super::fdlock::FdDirection;

impl Scheduler {
    fn memberships(&self) -> HashMap<ThreadId, usize> {
        let mut seen: HashMap<ThreadId, usize> = HashMap::new();
        let mut count = |id: ThreadId| *seen.entry(id).or_default() += 1;
        self.ready.iter().for_each(&mut count);
        for (_, m) in self.mutexes.iter() {
            m.waiters.iter().for_each(&mut count);
        }
        for (_, c) in self.conds.iter() {
            c.waiters.iter().for_each(&mut count);
        }
        for (_, rw) in self.rwlocks.iter() {
            rw.read_waiters.iter().for_each(&mut count);
            rw.write_waiters.iter().for_each(&mut count);
        }
        for (_, sem) in self.sems.iter() {
            sem.waiters.iter().for_each(&mut count);
        }
        for (_, t) in self.threads.iter() {
            t.join_waiters.iter().for_each(&mut count);
        }
        for entry in self.fds.values() {
            entry.dir(FdDirection::Read).waiters.iter().for_each(&mut count);
            entry.dir(FdDirection::Write).waiters.iter().for_each(&mut count);
        }
        self.io_waiters.iter().copied().for_each(&mut count);
        self.signal_waiters.iter().for_each(&mut count);
        self.child_waiters.iter().for_each(&mut count);
        self.spinners.iter().for_each(&mut count);
        seen
    }

    /// Whether the structure `slot` names actually holds `id`.
    fn slot_holds(&self, id: ThreadId, slot: WaitSlot) -> bool {
        match slot {
            WaitSlot::None | WaitSlot::Sleep => true,
            WaitSlot::Ready => self.ready.contains(id),
            WaitSlot::Mutex(m) => self.mutexes.get(m.0).is_some_and(|m| m.waiters.contains(id)),
            WaitSlot::Cond(c) => self.conds.get(c.0).is_some_and(|c| c.waiters.contains(id)),
            WaitSlot::RwRead(rw) => self
                .rwlocks
                .get(rw.0)
                .is_some_and(|rw| rw.read_waiters.contains(id)),
            WaitSlot::RwWrite(rw) => self
                .rwlocks
                .get(rw.0)
                .is_some_and(|rw| rw.write_waiters.contains(id)),
            WaitSlot::Sem(sem) => self.sems.get(sem.0).is_some_and(|s| s.waiters.contains(id)),
            WaitSlot::Join(target) => self
                .tcb(target)
                .is_some_and(|t| t.join_waiters.contains(id)),
            WaitSlot::FdLock(fd, dir) => self
                .fds
                .get(&fd)
                .is_some_and(|entry| entry.dir(dir).waiters.contains(id)),
            WaitSlot::Io => self.io_waiters.contains(&id),
            WaitSlot::Signal => self.signal_waiters.contains(id),
            WaitSlot::Child => self.child_waiters.contains(id),
            WaitSlot::Spin => self.spinners.contains(id),
        }
    }

    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        let seen = self.memberships();

        if let Some(cur) = self.current {
            let Some(t) = self.tcb(cur) else {
                return Err(format!("current thread {cur} does not exist"));
            };
            if t.state == ThreadState::Dead {
                return Err(format!("current thread {cur} is dead"));
            }
            if self.ready.contains(cur) {
                return Err(format!("current thread {cur} is also queued ready"));
            }
        }

        for id in self.all.iter() {
            let Some(t) = self.tcb(id) else {
                return Err(format!("{id} is listed live but has no TCB"));
            };
            if !t.is_valid() {
                return Err(format!("{id} has a corrupted TCB"));
            }
            let name = t.state.name();
            if t.state == ThreadState::Dead {
                return Err(format!("{id} is dead but still listed live"));
            }
            if t.active_priority != t.base_priority.max(t.inherited_priority) {
                return Err(format!(
                    "{id} active priority {} != max(base {}, inherited {})",
                    t.active_priority, t.base_priority, t.inherited_priority
                ));
            }
            let expected = match t.slot {
                WaitSlot::None | WaitSlot::Sleep => 0,
                _ => 1,
            };
            let found = seen.get(&id).copied().unwrap_or(0);
            if found != expected {
                return Err(format!(
                    "{id} ({name}, slot {:?}) is linked into {found} structures",
                    t.slot
                ));
            }
            if !self.slot_holds(id, t.slot) {
                return Err(format!("{id} slot {:?} does not hold it", t.slot));
            }
            match t.state {
                ThreadState::Running => {
                    let ok = t.slot == WaitSlot::Ready
                        || (t.slot == WaitSlot::None && self.current == Some(id));
                    if !ok {
                        return Err(format!("runnable {id} is neither current nor ready"));
                    }
                    if let Some(priority) = self.ready.priority_of(id)
                        && priority != t.active_priority
                    {
                        return Err(format!(
                            "{id} queued at {priority} but active priority is {}",
                            t.active_priority
                        ));
                    }
                }
                ThreadState::Suspended => {
                    if t.slot != WaitSlot::None {
                        return Err(format!("suspended {id} is linked at {:?}", t.slot));
                    }
                }
                _ => {
                    if matches!(t.slot, WaitSlot::None | WaitSlot::Ready) {
                        return Err(format!("{id} in {name} is not linked to a wait"));
                    }
                }
            }
        }

        for (&id, _) in seen.iter() {
            if !self.all.contains(id) {
                return Err(format!("dead or unknown {id} is still queued"));
            }
        }

        for (slot, m) in self.mutexes.iter() {
            if let Some(owner) = m.owner {
                let owns = self
                    .tcb(owner)
                    .is_some_and(|t| t.owned_mutexes.iter().any(|o| o.0 == slot));
                if !owns {
                    return Err(format!("mutex owner {owner} does not record ownership"));
                }
            }
        }
        for (slot, rw) in self.rwlocks.iter() {
            if !rw.holds_match_state() {
                return Err(format!("rwlock {slot:?} read holds disagree with its state"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn detects_double_linking() {
        let (mut s, _) = sched();
        let peer = spawn_prio(&mut s, 10);
        assert!(s.check_invariants().is_ok());
        s.spinners.push_back(peer);
        let err = s.check_invariants().unwrap_err();
        assert!(err.contains("2 structures"), "{err}");
    }

    #[test]
    fn detects_priority_mismatch() {
        let (mut s, _) = sched();
        let main = s.main_thread();
        s.tcb_mut(main).unwrap().active_priority = 3;
        assert!(s.check_invariants().unwrap_err().contains("active priority"));
    }

    #[test]
    #[should_panic(expected = "uthread invariant violation")]
    fn assert_invariants_panics_with_prefix() {
        let (mut s, _) = sched();
        let main = s.main_thread();
        s.tcb_mut(main).unwrap().state = ThreadState::CondWait;
        s.assert_invariants();
    }
}
