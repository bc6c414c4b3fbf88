//! The scheduler kernel.
//!
//! A [`Scheduler`] owns every TCB, the ready queue, all wait queues and the
//! synchronization objects. It never blocks and never touches the OS: the
//! runtime calls it under its lock, performs the actual switch, and feeds
//! back time, descriptor readiness and signals.
//!
//! Blocking operations return [`Step::Blocked`] after linking the caller
//! into the relevant queue; the runtime then calls [`Scheduler::dispatch`]
//! and parks the caller until it is current again. The caller inspects
//! [`Tcb::take_wake`](crate::tcb::Tcb::take_wake) (or re-issues the
//! operation) to learn the outcome.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::arena::Arena;
use crate::context::ContextKind;
use crate::errno::{Errno, Result};
use crate::pq::PriorityQueue;
use crate::queue::ThreadQueue;
use crate::signal::{SIG_MAX, SigAction, SigSet};
use crate::tcb::{SchedPolicy, Tcb, ThreadAttr, ThreadId, ThreadState, WaitSlot, WakeReason};

pub mod cond;
pub mod fdlock;
mod fork;
mod info;
mod invariants;
pub mod io;
mod lifecycle;
pub mod mutex;
pub mod rwlock;
pub mod sem;
mod signals;

pub use info::ThreadInfo;
pub use signals::{Delivery, Pending};

/// Prefix of every panic message raised for a broken scheduler invariant.
pub const VIOLATION_PREFIX: &str = "uthread invariant violation";

#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Time slice for round-robin scheduling.
    pub quantum: Duration,
    pub max_threads: usize,
    pub fd_table_size: usize,
    /// Signals may arrive from outside the scheduler (OS intake or a
    /// handle on another OS thread), so an all-blocked state is not a
    /// deadlock.
    pub external_signals: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            quantum: Duration::from_millis(20),
            max_threads: 1024,
            fd_table_size: 1024,
            external_signals: false,
        }
    }
}

/// Outcome of an operation that may suspend the caller.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<T = ()> {
    Done(T),
    /// The caller was linked into a wait structure and must relinquish.
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Switch to this thread.
    Run(ThreadId),
    /// Nothing is ready; wait for I/O, a signal, or the deadline.
    Idle { deadline: Option<Instant> },
    /// Threads remain but nothing can ever wake them.
    Deadlock,
    /// No non-daemon thread is left.
    Exhausted,
}

/// How the current thread leaves the CPU while still runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relinquish {
    /// Voluntary yield; goes behind its priority peers.
    Yield,
    /// Taken off at a safe point; keeps its place unless its slice ran out.
    Preempt,
}

#[derive(Debug)]
pub struct Scheduler {
    config: SchedConfig,
    threads: Arena<Tcb>,
    /// Every thread that is not dead, in creation order.
    all: ThreadQueue,
    /// Dead threads awaiting collection.
    dead: Vec<ThreadId>,
    ready: PriorityQueue,
    current: Option<ThreadId>,
    main: ThreadId,
    timeouts: BTreeSet<(Instant, ThreadId)>,
    io_waiters: Vec<ThreadId>,
    signal_waiters: ThreadQueue,
    child_waiters: ThreadQueue,
    spinners: ThreadQueue,
    mutexes: Arena<mutex::MutexState>,
    conds: Arena<cond::CondState>,
    rwlocks: Arena<rwlock::RwLockState>,
    sems: Arena<sem::SemState>,
    fds: HashMap<i32, fdlock::FdEntry>,
    sigactions: Vec<SigAction>,
    process_pending: SigSet,
    gc_cond: Option<cond::CondId>,
    last_now: Instant,
    dispatches: u64,
}

impl Scheduler {
    /// Creates a scheduler whose only thread is the running main thread.
    #[must_use]
    pub fn new(config: SchedConfig, now: Instant) -> Self {
        let mut threads = Arena::new();
        let attr = ThreadAttr {
            name: Some("main".to_string()),
            ..ThreadAttr::default()
        };
        let main = ThreadId(threads.insert_with(|slot| {
            Tcb::new(ThreadId(slot), &attr, attr.priority, SchedPolicy::Other)
        }));
        let mut all = ThreadQueue::new();
        all.push_back(main);
        Self {
            config,
            threads,
            all,
            dead: Vec::new(),
            ready: PriorityQueue::new(),
            current: Some(main),
            main,
            timeouts: BTreeSet::new(),
            io_waiters: Vec::new(),
            signal_waiters: ThreadQueue::new(),
            child_waiters: ThreadQueue::new(),
            spinners: ThreadQueue::new(),
            mutexes: Arena::new(),
            conds: Arena::new(),
            rwlocks: Arena::new(),
            sems: Arena::new(),
            fds: HashMap::new(),
            sigactions: vec![SigAction::default(); SIG_MAX as usize + 1],
            process_pending: SigSet::EMPTY,
            gc_cond: None,
            last_now: now,
            dispatches: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn set_external_signals(&mut self, on: bool) {
        self.config.external_signals = on;
    }

    #[must_use]
    pub fn main_thread(&self) -> ThreadId {
        self.main
    }

    #[must_use]
    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    #[must_use]
    pub fn tcb(&self, id: ThreadId) -> Option<&Tcb> {
        self.threads.get(id.0)
    }

    pub fn tcb_mut(&mut self, id: ThreadId) -> Option<&mut Tcb> {
        self.threads.get_mut(id.0)
    }

    /// Every thread still known to the scheduler, including dead ones not
    /// yet collected.
    #[must_use]
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.slots().into_iter().map(ThreadId).collect()
    }

    /// Threads that are not dead.
    #[must_use]
    pub fn live_threads(&self) -> Vec<ThreadId> {
        self.all.iter().collect()
    }

    #[must_use]
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    /// Threads in dispatch order.
    #[must_use]
    pub fn ready_order(&self) -> Vec<ThreadId> {
        self.ready.iter().collect()
    }

    /// Registers the condition variable the garbage collector sleeps on;
    /// it is broadcast whenever a thread becomes collectable.
    pub fn set_gc_cond(&mut self, cond: cond::CondId) {
        self.gc_cond = Some(cond);
    }

    fn non_daemon_live(&self) -> usize {
        self.all
            .iter()
            .filter(|&id| self.tcb(id).is_some_and(|t| !t.daemon))
            .count()
    }

    pub(crate) fn violation(&self, what: std::fmt::Arguments<'_>) -> ! {
        panic!(
            "{VIOLATION_PREFIX}: {what} (current={:?}, dispatches={})",
            self.current, self.dispatches
        )
    }

    pub(crate) fn live_tcb(&self, id: ThreadId) -> Result<&Tcb> {
        match self.tcb(id) {
            Some(t) if t.state != ThreadState::Dead => Ok(t),
            _ => Err(Errno::ESRCH),
        }
    }

    /// Puts `id` in `state`, linked at `slot`. The caller has already linked
    /// it into the queue that `slot` names.
    pub(crate) fn park(
        &mut self,
        id: ThreadId,
        state: ThreadState,
        slot: WaitSlot,
        deadline: Option<Instant>,
    ) {
        let Some(t) = self.threads.get_mut(id.0) else {
            self.violation(format_args!("blocking unknown thread {id}"));
        };
        t.state = state;
        t.slot = slot;
        t.wake = WakeReason::None;
        t.interrupted = false;
        t.timed_out = false;
        t.wake_deadline = deadline;
        t.context.capture(ContextKind::Cooperative);
        if let Some(deadline) = deadline {
            self.timeouts.insert((deadline, id));
        }
    }

    /// Inserts a runnable thread into the ready queue without touching its
    /// wake reason.
    fn enqueue_ready(&mut self, id: ThreadId) {
        let Some(t) = self.threads.get_mut(id.0) else {
            return;
        };
        t.state = ThreadState::Running;
        t.slot = WaitSlot::Ready;
        let priority = t.active_priority;
        if !self.ready.insert_tail(id, priority) {
            self.violation(format_args!("{id} inserted into the ready queue twice"));
        }
        self.arm_current_slice();
    }

    /// Completes a wait: records `reason` and makes the thread runnable, or
    /// parks it suspended if a suspend arrived during the wait.
    pub(crate) fn make_ready(&mut self, id: ThreadId, reason: WakeReason) {
        let Some(t) = self.threads.get_mut(id.0) else {
            return;
        };
        if let Some(deadline) = t.wake_deadline.take() {
            self.timeouts.remove(&(deadline, id));
        }
        t.wake = reason;
        t.slot = WaitSlot::None;
        match reason {
            WakeReason::Timeout => t.timed_out = true,
            WakeReason::Interrupted(_) => t.interrupted = true,
            _ => {}
        }
        if t.suspend == crate::tcb::SuspendMode::Pending {
            t.suspend = crate::tcb::SuspendMode::None;
            t.state = ThreadState::Suspended;
            return;
        }
        self.enqueue_ready(id);
    }

    /// Removes `id` from whatever structure its slot names.
    pub(crate) fn unlink(&mut self, id: ThreadId) {
        let Some(t) = self.threads.get_mut(id.0) else {
            return;
        };
        let slot = std::mem::replace(&mut t.slot, WaitSlot::None);
        if let Some(deadline) = t.wake_deadline.take() {
            self.timeouts.remove(&(deadline, id));
        }
        match slot {
            WaitSlot::None | WaitSlot::Sleep => {}
            WaitSlot::Ready => {
                self.ready.remove(id);
            }
            WaitSlot::Mutex(m) => {
                let owner = self.mutexes.get_mut(m.0).and_then(|state| {
                    state.waiters.remove(id);
                    state.owner
                });
                if let Some(owner) = owner {
                    self.refresh_priority(owner);
                }
            }
            WaitSlot::Cond(c) => {
                if let Some(state) = self.conds.get_mut(c.0) {
                    state.waiters.remove(id);
                    if state.waiters.is_empty() {
                        state.mutex = None;
                    }
                }
            }
            WaitSlot::RwRead(r) => {
                if let Some(state) = self.rwlocks.get_mut(r.0) {
                    state.read_waiters.remove(id);
                }
            }
            WaitSlot::RwWrite(r) => {
                if let Some(state) = self.rwlocks.get_mut(r.0)
                    && state.write_waiters.remove(id)
                {
                    state.blocked_writers = state.blocked_writers.saturating_sub(1);
                }
                // Readers queued behind this writer may now proceed.
                self.rwlock_grant(r);
            }
            WaitSlot::Sem(s) => {
                if let Some(state) = self.sems.get_mut(s.0) {
                    state.waiters.remove(id);
                }
            }
            WaitSlot::Join(target) => {
                if let Some(target) = self.threads.get_mut(target.0) {
                    target.join_waiters.remove(id);
                }
            }
            WaitSlot::FdLock(fd, dir) => {
                if let Some(entry) = self.fds.get_mut(&fd) {
                    entry.dir_mut(dir).waiters.remove(id);
                }
            }
            WaitSlot::Io => self.io_waiters.retain(|&w| w != id),
            WaitSlot::Signal => {
                self.signal_waiters.remove(id);
            }
            WaitSlot::Child => {
                self.child_waiters.remove(id);
            }
            WaitSlot::Spin => {
                self.spinners.remove(id);
            }
        }
    }

    /// Breaks a wait from outside: unlink, then make runnable.
    pub(crate) fn wake(&mut self, id: ThreadId, reason: WakeReason) {
        self.unlink(id);
        self.make_ready(id, reason);
    }

    fn arm_current_slice(&mut self) {
        let quantum = self.config.quantum;
        let now = self.last_now;
        if let Some(cur) = self.current
            && let Some(t) = self.threads.get_mut(cur.0)
            && t.state == ThreadState::Running
            && t.slice_deadline.is_none()
            && t.policy != SchedPolicy::Fifo
        {
            t.slice_deadline = Some(now + quantum);
        }
    }

    fn expire_timeouts(&mut self, now: Instant) {
        while let Some(&(deadline, id)) = self.timeouts.first() {
            if deadline > now {
                break;
            }
            self.timeouts.pop_first();
            if let Some(t) = self.threads.get_mut(id.0) {
                t.wake_deadline = None;
            }
            self.wake(id, WakeReason::Timeout);
        }
    }

    /// Earliest pending wake deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timeouts.first().map(|&(deadline, _)| deadline)
    }

    /// Picks the next thread to run.
    ///
    /// Expired timed waits are promoted, spin-blocked threads re-admitted,
    /// and the previous thread re-queued if it is still runnable.
    pub fn dispatch(&mut self, now: Instant) -> Dispatch {
        self.last_now = now;
        self.dispatches += 1;
        self.expire_timeouts(now);
        for id in self.spinners.drain() {
            if let Some(t) = self.threads.get_mut(id.0) {
                t.slot = WaitSlot::None;
            }
            self.make_ready(id, WakeReason::Notified);
        }

        if let Some(prev) = self.current.take()
            && let Some(t) = self.threads.get_mut(prev.0)
            && t.state == ThreadState::Running
            && t.slot == WaitSlot::None
        {
            t.slot = WaitSlot::Ready;
            let priority = t.active_priority;
            let inserted = if t.slice_expired {
                self.ready.insert_tail(prev, priority)
            } else {
                self.ready.insert_head(prev, priority)
            };
            if !inserted {
                self.violation(format_args!("{prev} was running while queued"));
            }
        }

        if let Some(next) = self.ready.pop() {
            let others = !self.ready.is_empty();
            let quantum = self.config.quantum;
            let Some(t) = self.threads.get_mut(next.0) else {
                self.violation(format_args!("ready queue holds freed thread {next}"));
            };
            if !t.is_valid() || t.state != ThreadState::Running {
                let state = t.state.name();
                self.violation(format_args!("resuming {next} in state {state}"));
            }
            if let Err(err) = t.context.restore(next) {
                self.violation(format_args!("cannot resume {next}: {err}"));
            }
            t.slot = WaitSlot::None;
            t.slice_expired = false;
            t.slice_deadline = if others && t.policy != SchedPolicy::Fifo {
                Some(now + quantum)
            } else {
                None
            };
            self.current = Some(next);
            return Dispatch::Run(next);
        }

        if self.non_daemon_live() == 0 {
            return Dispatch::Exhausted;
        }
        let deadline = self.next_deadline();
        if deadline.is_some() || !self.io_waiters.is_empty() || self.config.external_signals {
            Dispatch::Idle { deadline }
        } else {
            Dispatch::Deadlock
        }
    }

    /// Whether the current thread should give up the CPU at a safe point.
    /// Timed waits due by `now` are promoted first, so an expired waiter of
    /// higher priority preempts even when nothing else was runnable.
    /// While the current thread defers signals the request is remembered
    /// instead.
    pub fn should_yield(&mut self, now: Instant) -> bool {
        self.last_now = now;
        self.expire_timeouts(now);
        let Some(cur) = self.current else {
            return false;
        };
        let Some(top) = self.ready.first_priority() else {
            return false;
        };
        let Some(t) = self.threads.get_mut(cur.0) else {
            return false;
        };
        if t.state != ThreadState::Running {
            return false;
        }
        let due = top > t.active_priority
            || (top == t.active_priority
                && t.policy != SchedPolicy::Fifo
                && t.slice_deadline.is_some_and(|deadline| now >= deadline));
        if due && t.sig_defer > 0 {
            t.yield_pending = true;
            return false;
        }
        due
    }

    /// Takes the current thread off the CPU while leaving it runnable.
    /// The runtime follows with [`dispatch`](Self::dispatch).
    pub fn relinquish(&mut self, how: Relinquish, now: Instant) {
        let Some(cur) = self.current else {
            return;
        };
        let Some(t) = self.threads.get_mut(cur.0) else {
            return;
        };
        match how {
            Relinquish::Yield => {
                t.slice_expired = true;
                t.context.capture(ContextKind::Cooperative);
            }
            Relinquish::Preempt => {
                t.slice_expired = t.slice_deadline.is_some_and(|deadline| now >= deadline);
                t.context.capture(ContextKind::Interrupted);
            }
        }
    }

    /// Enters a signal-deferral critical section.
    pub fn defer_signals(&mut self, me: ThreadId) {
        if let Some(t) = self.threads.get_mut(me.0) {
            t.sig_defer += 1;
        }
    }

    /// Leaves a critical section. Returns true when the thread reached zero
    /// with a coalesced yield request that should now be honored.
    pub fn undefer_signals(&mut self, me: ThreadId) -> bool {
        let Some(t) = self.threads.get_mut(me.0) else {
            return false;
        };
        t.sig_defer = t.sig_defer.saturating_sub(1);
        if t.sig_defer == 0 {
            std::mem::take(&mut t.yield_pending)
        } else {
            false
        }
    }

    /// Runs the full structural check and panics on failure.
    pub fn assert_invariants(&self) {
        if let Err(problem) = self.check_invariants() {
            self.violation(format_args!("{problem}"));
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_scheduler_runs_main() {
        let (s, _) = sched();
        assert_eq!(s.current(), Some(s.main_thread()));
        assert_eq!(s.live_threads(), vec![s.main_thread()]);
        s.assert_invariants();
    }

    #[test]
    fn running_thread_keeps_cpu_until_it_yields() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let peer = spawn_prio(&mut s, 15);
        assert!(!s.should_yield(now), "slice not yet used");
        assert_eq!(run_next(&mut s, now), main, "unexpired slice keeps its place");
        s.relinquish(Relinquish::Yield, now);
        assert_eq!(run_next(&mut s, now), peer);
    }

    #[test]
    fn slice_expiry_rotates_equal_priority() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let peer = spawn_prio(&mut s, 15);
        let later = now + s.config().quantum * 2;
        assert!(s.should_yield(later));
        s.relinquish(Relinquish::Preempt, later);
        assert_eq!(run_next(&mut s, later), peer);
        assert_eq!(s.ready_order(), vec![main]);
    }

    #[test]
    fn fifo_policy_is_never_sliced() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        s.set_schedparam(main, SchedPolicy::Fifo, 15).unwrap();
        let _peer = spawn_prio(&mut s, 15);
        assert!(!s.should_yield(now + Duration::from_secs(10)));
    }

    #[test]
    fn higher_priority_ready_thread_preempts() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let high = spawn_prio(&mut s, 20);
        assert!(s.should_yield(now));
        s.relinquish(Relinquish::Preempt, now);
        assert_eq!(run_next(&mut s, now), high);
        assert_eq!(s.ready_order(), vec![main], "preempted thread keeps its head position");
    }

    #[test]
    fn expired_sleeper_preempts_lone_runner_at_safe_point() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let sleeper = spawn_prio(&mut s, 20);
        assert_eq!(run_next(&mut s, now), sleeper);
        let wake_at = now + Duration::from_millis(5);
        assert_eq!(s.sleep_until(sleeper, wake_at, now), Step::Blocked);
        assert_eq!(run_next(&mut s, now), main);
        assert_eq!(s.tcb(main).unwrap().slice_deadline, None, "alone, so unsliced");

        assert!(!s.should_yield(now + Duration::from_millis(1)));
        assert!(s.should_yield(wake_at));
        assert_eq!(s.ready_order(), vec![sleeper]);
        s.relinquish(Relinquish::Preempt, wake_at);
        assert_eq!(run_next(&mut s, wake_at), sleeper);
        assert_eq!(s.tcb_mut(sleeper).unwrap().take_wake(), WakeReason::Timeout);
        assert_eq!(s.ready_order(), vec![main]);
    }

    #[test]
    fn deferral_coalesces_yield_request() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let _high = spawn_prio(&mut s, 25);
        s.defer_signals(main);
        s.defer_signals(main);
        assert!(!s.should_yield(now));
        assert!(!s.undefer_signals(main), "still nested");
        assert!(s.undefer_signals(main), "replayed at depth zero");
    }

    #[test]
    fn only_daemons_left_is_exhausted() {
        let (mut s, now) = sched();
        let daemon = s
            .spawn(
                None,
                &ThreadAttr {
                    daemon: true,
                    ..ThreadAttr::default()
                },
            )
            .unwrap();
        let _ = s.exit_current(0);
        assert_eq!(run_next(&mut s, now), daemon);
        let _ = s.sleep_until(daemon, now + Duration::from_secs(1), now);
        assert_eq!(s.dispatch(now), Dispatch::Exhausted);
    }

    #[test]
    fn blocked_without_wake_source_is_deadlock() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let m = s.mutex_init(Default::default()).unwrap();
        let peer = spawn_prio(&mut s, 15);
        assert_eq!(s.mutex_lock(main, m), Ok(Step::Done(())));
        s.relinquish(Relinquish::Yield, now);
        assert_eq!(run_next(&mut s, now), peer);
        assert_eq!(s.mutex_lock(peer, m), Ok(Step::Blocked));
        assert_eq!(run_next(&mut s, now), main);
        let join = s.join(main, peer).unwrap();
        assert_eq!(join, Step::Blocked);
        assert_eq!(s.dispatch(now), Dispatch::Deadlock);
        s.set_external_signals(true);
        assert_eq!(s.dispatch(now), Dispatch::Idle { deadline: None });
    }

    #[test]
    fn idle_reports_soonest_deadline() {
        let (mut s, now) = sched();
        let main = s.main_thread();
        let wake_at = now + Duration::from_millis(50);
        assert_eq!(s.sleep_until(main, wake_at, now), Step::Blocked);
        assert_eq!(
            s.dispatch(now),
            Dispatch::Idle {
                deadline: Some(wake_at)
            }
        );
        assert_eq!(run_next(&mut s, wake_at), main);
        let t = s.tcb_mut(main).unwrap();
        assert!(t.timed_out);
        assert_eq!(t.take_wake(), WakeReason::Timeout);
    }

    proptest! {
        /// Whatever the creation order, threads run strictly by priority and
        /// FIFO within a priority once the creator blocks.
        #[test]
        fn prop_dispatch_order_is_priority_then_creation(
            prios in proptest::collection::vec(0u8..=31, 1..24)
        ) {
            let (mut s, now) = sched();
            let main = s.main_thread();
            let ids: Vec<ThreadId> = prios.iter().map(|&p| spawn_prio(&mut s, p)).collect();
            let _ = s.sleep_until(main, now + Duration::from_secs(3600), now);
            let mut expected: Vec<usize> = (0..ids.len()).collect();
            expected.sort_by(|&a, &b| prios[b].cmp(&prios[a]).then(a.cmp(&b)));
            for index in expected {
                let next = run_next(&mut s, now);
                prop_assert_eq!(next, ids[index]);
                let _ = s.exit_current(0);
            }
        }
    }
}
