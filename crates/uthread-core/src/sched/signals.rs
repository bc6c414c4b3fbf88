//! Signal delivery.
//!
//! Process-directed signals are routed to one thread: a `sigwait`er for
//! that signal first, then a thread in `sigsuspend` that does not block it,
//! then any thread that does not block it (the current thread preferred).
//! With no taker the signal stays process-pending until some thread
//! unmasks it. A thread in an interruptible wait is woken with
//! [`WakeReason::Interrupted`]; handlers themselves run in the runtime,
//! one signal frame at a time, via [`Scheduler::next_deliverable`].

use crate::context::SignalFrame;
use crate::errno::{Errno, Result};
use crate::signal::{
    self, Effect, SIGCHLD, SigAction, SigHow, SigSet, Signal, effect_of, is_unblockable,
};
use crate::tcb::{ThreadId, ThreadState, WaitSlot, WakeReason};

use super::{Scheduler, Step};

/// Where a process-directed signal went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Discarded by its disposition.
    Dropped,
    Thread(ThreadId),
    /// Every thread blocks it; kept process-pending.
    Pending,
}

/// A signal the current thread must act on now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// Run the registered handler inside a signal frame.
    Handle(Signal, SigAction),
    /// Default action terminates the process.
    Terminate(Signal),
}

impl Scheduler {
    fn action(&self, sig: Signal) -> SigAction {
        self.sigactions
            .get(sig as usize)
            .copied()
            .unwrap_or_default()
    }

    /// Installs `action` for `sig` and returns the previous one. Switching
    /// to a discarding disposition drops the signal wherever it is pending.
    pub fn sigaction(&mut self, sig: Signal, action: SigAction) -> Result<SigAction> {
        signal::validate(sig)?;
        if is_unblockable(sig) {
            return Err(Errno::EINVAL);
        }
        let action = SigAction {
            mask: action.mask.maskable(),
            ..action
        };
        let old = std::mem::replace(&mut self.sigactions[sig as usize], action);
        if effect_of(sig, &action) == Effect::Discard {
            self.process_pending.remove(sig);
            for (_, t) in self.threads.iter_mut() {
                t.sig_pending.remove(sig);
            }
        }
        Ok(old)
    }

    pub fn sigaction_of(&self, sig: Signal) -> Result<SigAction> {
        signal::validate(sig)?;
        Ok(self.action(sig))
    }

    /// Examines and changes the blocked set of `me`; returns the old one.
    pub fn sigmask(&mut self, me: ThreadId, how: SigHow, set: Option<SigSet>) -> Result<SigSet> {
        let t = self.threads.get_mut(me.0).ok_or(Errno::ESRCH)?;
        let old = t.sig_mask;
        if let Some(set) = set {
            let mask = match how {
                SigHow::Block => old.union(set),
                SigHow::Unblock => old.difference(set),
                SigHow::SetMask => set,
            };
            t.sig_mask = mask.maskable();
        }
        Ok(old)
    }

    /// Directs `sig` at one thread. Signal 0 only checks that `target`
    /// exists.
    pub fn kill(&mut self, target: ThreadId, sig: Signal) -> Result<()> {
        self.live_tcb(target)?;
        if sig == 0 {
            return Ok(());
        }
        signal::validate(sig)?;
        self.deliver_to_thread(target, sig);
        Ok(())
    }

    /// Routes a process-directed signal.
    pub fn raise_process(&mut self, sig: Signal) -> Result<Delivery> {
        signal::validate(sig)?;
        if sig == SIGCHLD {
            self.child_event();
        }
        let waiter = self.signal_waiters.iter().find(|&id| {
            self.tcb(id)
                .is_some_and(|t| t.state == ThreadState::SigWait && t.sigwait_set.contains(sig))
        });
        if let Some(id) = waiter {
            self.deliver_to_thread(id, sig);
            return Ok(Delivery::Thread(id));
        }
        if effect_of(sig, &self.action(sig)) == Effect::Discard {
            return Ok(Delivery::Dropped);
        }
        let takes = |s: &Self, id: ThreadId| {
            s.tcb(id)
                .is_some_and(|t| t.state != ThreadState::Dead && !t.sig_mask.contains(sig))
        };
        let suspender = self.signal_waiters.iter().find(|&id| {
            takes(self, id) && self.tcb(id).is_some_and(|t| t.state == ThreadState::SigSuspend)
        });
        let target = suspender
            .or_else(|| self.current.filter(|&id| takes(self, id)))
            .or_else(|| self.all.iter().find(|&id| takes(self, id)));
        match target {
            Some(id) => {
                self.deliver_to_thread(id, sig);
                Ok(Delivery::Thread(id))
            }
            None => {
                self.process_pending.insert(sig);
                Ok(Delivery::Pending)
            }
        }
    }

    fn deliver_to_thread(&mut self, id: ThreadId, sig: Signal) {
        let action = self.action(sig);
        let Some(t) = self.threads.get_mut(id.0) else {
            return;
        };
        if t.state == ThreadState::SigWait && t.sigwait_set.contains(sig) {
            t.sigwait_set = SigSet::EMPTY;
            self.wake(id, WakeReason::Accepted(sig));
            return;
        }
        if effect_of(sig, &action) == Effect::Discard {
            return;
        }
        t.sig_pending.insert(sig);
        if !t.sig_mask.contains(sig) && t.state.is_interruptible() && !t.slot.defers_signals() {
            self.wake(id, WakeReason::Interrupted(sig));
        }
    }

    /// Takes the lowest-numbered signal `me` must act on now, first
    /// claiming process-pending signals it no longer blocks. Discarded
    /// signals are consumed silently.
    pub fn next_deliverable(&mut self, me: ThreadId) -> Option<Pending> {
        loop {
            let claimable = self.process_pending;
            let t = self.threads.get_mut(me.0)?;
            let claim = claimable.difference(t.sig_mask);
            t.sig_pending = t.sig_pending.union(claim);
            self.process_pending = self.process_pending.difference(claim);

            let t = self.threads.get_mut(me.0)?;
            let sig = t.deliverable().first()?;
            t.sig_pending.remove(sig);
            let action = self.action(sig);
            match effect_of(sig, &action) {
                Effect::Discard => continue,
                Effect::Handle => return Some(Pending::Handle(sig, action)),
                Effect::Terminate => return Some(Pending::Terminate(sig)),
            }
        }
    }

    /// Enters a handler for `sig`: blocks the signal and its action mask
    /// until [`pop_signal_frame`](Self::pop_signal_frame).
    pub fn push_signal_frame(&mut self, me: ThreadId, sig: Signal) -> SigSet {
        let action = self.action(sig);
        let Some(t) = self.threads.get_mut(me.0) else {
            return SigSet::EMPTY;
        };
        let saved = t.sig_mask;
        t.context.push_frame(SignalFrame {
            signal: sig,
            saved_mask: saved,
        });
        t.sig_mask = saved.union(action.mask).with(sig).maskable();
        saved
    }

    /// Leaves the innermost handler, restoring the mask it saved.
    pub fn pop_signal_frame(&mut self, me: ThreadId) -> Option<Signal> {
        let t = self.threads.get_mut(me.0)?;
        let frame = t.context.pop_frame()?;
        t.sig_mask = frame.saved_mask;
        Some(frame.signal)
    }

    /// Waits for a member of `set`. A pending member is taken at once.
    pub fn sigwait(&mut self, me: ThreadId, set: SigSet) -> Result<Step<Signal>> {
        let set = set.maskable();
        if set.is_empty() {
            return Err(Errno::EINVAL);
        }
        let from_process = self.process_pending.intersect(set).first();
        let t = self.threads.get_mut(me.0).ok_or(Errno::ESRCH)?;
        if let Some(sig) = t.sig_pending.intersect(set).first() {
            t.sig_pending.remove(sig);
            return Ok(Step::Done(sig));
        }
        if let Some(sig) = from_process {
            self.process_pending.remove(sig);
            return Ok(Step::Done(sig));
        }
        t.sigwait_set = set;
        self.signal_waiters.push_back(me);
        self.park(me, ThreadState::SigWait, WaitSlot::Signal, None);
        Ok(Step::Blocked)
    }

    /// Replaces the mask with `mask` and waits for a deliverable signal.
    /// The caller runs the handlers, then calls
    /// [`end_sigsuspend`](Self::end_sigsuspend).
    pub fn sigsuspend(&mut self, me: ThreadId, mask: SigSet) -> Step {
        let claimable = self.process_pending;
        let Some(t) = self.threads.get_mut(me.0) else {
            return Step::Done(());
        };
        t.sigsuspend_saved = Some(t.sig_mask);
        t.sig_mask = mask.maskable();
        if !t.deliverable().is_empty() || !claimable.difference(t.sig_mask).is_empty() {
            return Step::Done(());
        }
        self.signal_waiters.push_back(me);
        self.park(me, ThreadState::SigSuspend, WaitSlot::Signal, None);
        Step::Blocked
    }

    pub fn end_sigsuspend(&mut self, me: ThreadId) {
        if let Some(t) = self.threads.get_mut(me.0)
            && let Some(saved) = t.sigsuspend_saved.take()
        {
            t.sig_mask = saved;
        }
    }

    /// Signals raised for `me` or the process and not yet delivered.
    #[must_use]
    pub fn sigpending(&self, me: ThreadId) -> SigSet {
        self.tcb(me)
            .map_or(SigSet::EMPTY, |t| t.sig_pending)
            .union(self.process_pending)
    }
}
