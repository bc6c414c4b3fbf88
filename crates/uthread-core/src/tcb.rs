//! Thread control blocks.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::arena::arena_handle;
use crate::context::Context;
use crate::queue::ThreadQueue;
use crate::sched::cond::CondId;
use crate::sched::fdlock::FdDirection;
use crate::sched::io::PollEntry;
use crate::sched::mutex::MutexId;
use crate::sched::rwlock::RwLockId;
use crate::sched::sem::SemId;
use crate::signal::{SigSet, Signal};

arena_handle!(
    /// Handle of a thread; stays unique for the life of the scheduler.
    ThreadId,
    "t"
);

pub const PRIO_MIN: u8 = 0;
pub const PRIO_DEFAULT: u8 = 15;
pub const PRIO_MAX: u8 = 31;

/// Exit value reported by `join` for a canceled thread.
pub const CANCELED: usize = usize::MAX;

const TCB_MAGIC: u32 = 0xd09b_a115;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadState {
    Running,
    Suspended,
    Dead,
    MutexWait,
    CondWait,
    SemWait,
    RwLockWait,
    Join,
    FdReadWait,
    FdWriteWait,
    FdLockReadWait,
    FdLockWriteWait,
    SelectWait,
    PollWait,
    SleepWait,
    SigWait,
    SigSuspend,
    WaitWait,
    SpinBlock,
}

impl ThreadState {
    #[must_use]
    pub fn is_wait(self) -> bool {
        !matches!(
            self,
            ThreadState::Running | ThreadState::Suspended | ThreadState::Dead
        )
    }

    /// Waits that signal delivery may break.
    #[must_use]
    pub fn is_interruptible(self) -> bool {
        self.is_wait()
            && !matches!(
                self,
                ThreadState::MutexWait
                    | ThreadState::FdLockReadWait
                    | ThreadState::FdLockWriteWait
                    | ThreadState::SpinBlock
            )
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ThreadState::Running => "RUNNING",
            ThreadState::Suspended => "SUSPENDED",
            ThreadState::Dead => "DEAD",
            ThreadState::MutexWait => "MUTEX_WAIT",
            ThreadState::CondWait => "COND_WAIT",
            ThreadState::SemWait => "SEM_WAIT",
            ThreadState::RwLockWait => "RWLOCK_WAIT",
            ThreadState::Join => "JOIN",
            ThreadState::FdReadWait => "FD_READ_WAIT",
            ThreadState::FdWriteWait => "FD_WRITE_WAIT",
            ThreadState::FdLockReadWait => "FD_LOCK_READ_WAIT",
            ThreadState::FdLockWriteWait => "FD_LOCK_WRITE_WAIT",
            ThreadState::SelectWait => "SELECT_WAIT",
            ThreadState::PollWait => "POLL_WAIT",
            ThreadState::SleepWait => "SLEEP_WAIT",
            ThreadState::SigWait => "SIGWAIT",
            ThreadState::SigSuspend => "SIGSUSPEND",
            ThreadState::WaitWait => "WAIT_WAIT",
            ThreadState::SpinBlock => "SPINBLOCK",
        }
    }
}

/// The one scheduling structure a thread is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSlot {
    None,
    Ready,
    Mutex(MutexId),
    Cond(CondId),
    RwRead(RwLockId),
    RwWrite(RwLockId),
    Sem(SemId),
    Join(ThreadId),
    FdLock(i32, FdDirection),
    Io,
    Sleep,
    Signal,
    Child,
    Spin,
}

impl WaitSlot {
    /// Lock hand-off queues; signals wait until the thread is granted.
    #[must_use]
    pub fn defers_signals(self) -> bool {
        matches!(
            self,
            WaitSlot::Mutex(_)
                | WaitSlot::RwRead(_)
                | WaitSlot::RwWrite(_)
                | WaitSlot::FdLock(..)
                | WaitSlot::Spin
        )
    }
}

/// Why a blocked thread was made runnable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    #[default]
    None,
    /// Ownership of a lock was handed over.
    Granted,
    /// The awaited condition may now hold (cond signal, sem post, join
    /// target exit, child event, resume).
    Notified,
    /// A polled descriptor became ready.
    Ready,
    Timeout,
    Interrupted(Signal),
    /// `sigwait` accepted this signal.
    Accepted(Signal),
    Canceled,
    /// The descriptor was closed while waiting for its lock.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedPolicy {
    Fifo,
    RoundRobin,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelState {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelType {
    #[default]
    Deferred,
    Asynchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuspendMode {
    #[default]
    None,
    /// Suspend requested while waiting; applied when the wait completes.
    Pending,
}

/// Creation attributes.
#[derive(Debug, Clone)]
pub struct ThreadAttr {
    pub name: Option<String>,
    pub priority: u8,
    pub policy: SchedPolicy,
    /// Take priority and policy from the creator instead of this attr.
    pub inherit_sched: bool,
    pub detached: bool,
    pub suspended: bool,
    pub daemon: bool,
    pub stack_size: Option<usize>,
}

impl Default for ThreadAttr {
    fn default() -> Self {
        Self {
            name: None,
            priority: PRIO_DEFAULT,
            policy: SchedPolicy::Other,
            inherit_sched: false,
            detached: false,
            suspended: false,
            daemon: false,
            stack_size: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tcb {
    pub id: ThreadId,
    magic: u32,
    pub name: Option<String>,

    pub state: ThreadState,
    pub base_priority: u8,
    pub inherited_priority: u8,
    pub active_priority: u8,
    pub policy: SchedPolicy,
    pub slot: WaitSlot,
    pub slice_deadline: Option<Instant>,
    pub slice_expired: bool,
    pub context: Context,

    pub sig_mask: SigSet,
    pub sig_pending: SigSet,
    pub sig_defer: u32,
    pub yield_pending: bool,
    pub sigwait_set: SigSet,
    pub sigsuspend_saved: Option<SigSet>,

    pub owned_mutexes: Vec<MutexId>,
    pub join_waiters: ThreadQueue,
    /// Mutex and recursion count to restore after a condvar wait.
    pub cond_relock: Option<(MutexId, u32)>,

    pub poll_set: Vec<PollEntry>,
    pub wake_deadline: Option<Instant>,
    pub interrupted: bool,
    pub timed_out: bool,
    pub wake: WakeReason,

    pub detached: bool,
    pub exiting: bool,
    pub daemon: bool,
    pub joined: bool,
    pub suspend: SuspendMode,
    pub cancel_state: CancelState,
    pub cancel_type: CancelType,
    pub cancel_pending: bool,
    pub exit_value: Option<usize>,
    pub stack_size: Option<usize>,
}

impl Tcb {
    pub(crate) fn new(id: ThreadId, attr: &ThreadAttr, priority: u8, policy: SchedPolicy) -> Self {
        Self {
            id,
            magic: TCB_MAGIC,
            name: attr.name.clone(),
            state: ThreadState::Running,
            base_priority: priority,
            inherited_priority: 0,
            active_priority: priority,
            policy,
            slot: WaitSlot::None,
            slice_deadline: None,
            slice_expired: false,
            context: Context::new(id),
            sig_mask: SigSet::EMPTY,
            sig_pending: SigSet::EMPTY,
            sig_defer: 0,
            yield_pending: false,
            sigwait_set: SigSet::EMPTY,
            sigsuspend_saved: None,
            owned_mutexes: Vec::new(),
            join_waiters: ThreadQueue::new(),
            cond_relock: None,
            poll_set: Vec::new(),
            wake_deadline: None,
            interrupted: false,
            timed_out: false,
            wake: WakeReason::None,
            detached: attr.detached,
            exiting: false,
            daemon: attr.daemon,
            joined: false,
            suspend: SuspendMode::None,
            cancel_state: CancelState::Enabled,
            cancel_type: CancelType::Deferred,
            cancel_pending: false,
            exit_value: None,
            stack_size: attr.stack_size,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == TCB_MAGIC
    }

    pub(crate) fn invalidate(&mut self) {
        self.magic = 0;
        self.context.retire();
    }

    /// Consumes the wake reason left by whoever made the thread runnable.
    pub fn take_wake(&mut self) -> WakeReason {
        std::mem::take(&mut self.wake)
    }

    #[must_use]
    pub fn cancel_actionable(&self) -> bool {
        self.cancel_pending && self.cancel_state == CancelState::Enabled && !self.exiting
    }

    /// Signals that would run a handler or be acted on right now.
    #[must_use]
    pub fn deliverable(&self) -> SigSet {
        self.sig_pending.difference(self.sig_mask)
    }

    #[must_use]
    pub fn slice_remaining(&self, now: Instant) -> Option<Duration> {
        self.slice_deadline.map(|d| d.saturating_duration_since(now))
    }
}

/// Validates a priority supplied by a caller.
pub fn check_priority(priority: u8) -> crate::errno::Result<u8> {
    if priority <= PRIO_MAX {
        Ok(priority)
    } else {
        Err(crate::errno::Errno::EINVAL)
    }
}
