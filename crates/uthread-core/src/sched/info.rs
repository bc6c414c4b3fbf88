//! Per-thread state dump for diagnostics.

use serde::Serialize;

use crate::signal::SigSet;
use crate::tcb::{CancelState, CancelType, SchedPolicy, ThreadId, ThreadState, WaitSlot};

use super::Scheduler;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: Option<String>,
    pub state: ThreadState,
    pub current: bool,
    pub base_priority: u8,
    pub inherited_priority: u8,
    pub active_priority: u8,
    pub policy: SchedPolicy,
    /// The structure the thread is linked into, if any.
    pub waiting_on: Option<String>,
    /// Time left until the wait deadline, in milliseconds.
    pub deadline_ms: Option<u64>,
    pub sig_mask: SigSet,
    pub sig_pending: SigSet,
    pub handler_depth: usize,
    pub owned_mutexes: usize,
    pub detached: bool,
    pub daemon: bool,
    pub cancel_state: CancelState,
    pub cancel_type: CancelType,
    pub cancel_pending: bool,
    pub exit_value: Option<usize>,
}

fn describe(slot: WaitSlot) -> Option<String> {
    let text = match slot {
        WaitSlot::None => return None,
        WaitSlot::Ready => "ready queue".to_string(),
        WaitSlot::Mutex(m) => format!("mutex {m}"),
        WaitSlot::Cond(c) => format!("condvar {c}"),
        WaitSlot::RwRead(rw) => format!("rwlock {rw} (read)"),
        WaitSlot::RwWrite(rw) => format!("rwlock {rw} (write)"),
        WaitSlot::Sem(sem) => format!("semaphore {sem}"),
        WaitSlot::Join(t) => format!("join {t}"),
        WaitSlot::FdLock(fd, dir) => format!("fd {fd} lock ({dir:?})"),
        WaitSlot::Io => "descriptor readiness".to_string(),
        WaitSlot::Sleep => "sleep".to_string(),
        WaitSlot::Signal => "signal".to_string(),
        WaitSlot::Child => "child process".to_string(),
        WaitSlot::Spin => "spin".to_string(),
    };
    Some(text)
}

impl Scheduler {
    /// One record per known thread, live ones first in creation order.
    #[must_use]
    pub fn dump_info(&self) -> Vec<ThreadInfo> {
        let live = self.all.iter();
        let dead = self.dead.iter().copied();
        live.chain(dead)
            .filter_map(|id| self.tcb(id))
            .map(|t| ThreadInfo {
                id: t.id,
                name: t.name.clone(),
                state: t.state,
                current: self.current == Some(t.id),
                base_priority: t.base_priority,
                inherited_priority: t.inherited_priority,
                active_priority: t.active_priority,
                policy: t.policy,
                waiting_on: describe(t.slot),
                deadline_ms: t.wake_deadline.map(|deadline| {
                    let left = deadline.saturating_duration_since(self.last_now);
                    u64::try_from(left.as_millis()).unwrap_or(u64::MAX)
                }),
                sig_mask: t.sig_mask,
                sig_pending: t.sig_pending,
                handler_depth: t.context.depth(),
                owned_mutexes: t.owned_mutexes.len(),
                detached: t.detached,
                daemon: t.daemon,
                cancel_state: t.cancel_state,
                cancel_type: t.cancel_type,
                cancel_pending: t.cancel_pending,
                exit_value: t.exit_value,
            })
            .collect()
    }
}
