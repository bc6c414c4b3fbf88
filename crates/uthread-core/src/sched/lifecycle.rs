//! Thread creation, termination, joining, cancellation and suspension.

use crate::errno::{Errno, Result};
use crate::tcb::{
    CANCELED, CancelState, CancelType, SchedPolicy, SuspendMode, Tcb, ThreadAttr, ThreadId,
    ThreadState, WaitSlot, WakeReason, check_priority,
};

use super::{Scheduler, Step};

impl Scheduler {
    /// Creates a thread. It starts RUNNING at the tail of its priority, or
    /// SUSPENDED when the attribute asks for it.
    pub fn spawn(&mut self, creator: Option<ThreadId>, attr: &ThreadAttr) -> Result<ThreadId> {
        if self.all.len() >= self.config.max_threads {
            return Err(Errno::EAGAIN);
        }
        check_priority(attr.priority)?;
        let parent = creator.and_then(|c| self.tcb(c));
        let (priority, policy) = match parent {
            Some(p) if attr.inherit_sched => (p.base_priority, p.policy),
            _ => (attr.priority, attr.policy),
        };
        let mask = parent.map(|p| p.sig_mask).unwrap_or_default();
        let id = ThreadId(
            self.threads
                .insert_with(|slot| Tcb::new(ThreadId(slot), attr, priority, policy)),
        );
        if let Some(t) = self.threads.get_mut(id.0) {
            t.sig_mask = mask;
        }
        self.all.push_back(id);
        if attr.suspended {
            if let Some(t) = self.threads.get_mut(id.0) {
                t.state = ThreadState::Suspended;
            }
        } else {
            self.enqueue_ready(id);
        }
        Ok(id)
    }

    /// Drops a thread that was created but whose execution context could
    /// not be started.
    pub fn discard_unstarted(&mut self, id: ThreadId) {
        self.unlink(id);
        self.all.remove(id);
        self.threads.remove(id.0);
    }

    /// Terminates the running thread with `value` and returns its id.
    pub fn exit_current(&mut self, value: usize) -> ThreadId {
        let Some(id) = self.current.take() else {
            self.violation(format_args!("exit with no current thread"));
        };
        self.finish_thread(id, value);
        id
    }

    /// Forcibly terminates `id` wherever it is (runtime shutdown).
    pub fn reap(&mut self, id: ThreadId) {
        if self.current == Some(id) {
            self.current = None;
        }
        if self.tcb(id).is_some_and(|t| t.state != ThreadState::Dead) {
            self.finish_thread(id, CANCELED);
        }
    }

    fn finish_thread(&mut self, id: ThreadId, value: usize) {
        self.unlink(id);
        let Some(t) = self.threads.get_mut(id.0) else {
            return;
        };
        t.state = ThreadState::Dead;
        t.exiting = true;
        t.exit_value = Some(value);
        t.sig_pending = crate::signal::SigSet::EMPTY;
        t.context.retire();
        let joiners = t.join_waiters.drain();
        self.all.remove(id);
        self.dead.push(id);
        for joiner in joiners {
            self.wake(joiner, WakeReason::Notified);
        }
        self.notify_gc();
    }

    fn notify_gc(&mut self) {
        if let Some(cond) = self.gc_cond {
            let _ = self.cond_broadcast(cond);
        }
    }

    fn collectable(t: &Tcb) -> bool {
        t.state == ThreadState::Dead && (t.detached || t.joined)
    }

    #[must_use]
    pub fn has_garbage(&self) -> bool {
        self.dead
            .iter()
            .any(|&id| self.tcb(id).is_some_and(Self::collectable))
    }

    /// Frees every dead thread that is detached or already joined and
    /// returns their ids so the runtime can release their stacks.
    pub fn collect_garbage(&mut self) -> Vec<ThreadId> {
        let mut freed = Vec::new();
        let mut keep = Vec::new();
        for id in std::mem::take(&mut self.dead) {
            match self.threads.get_mut(id.0) {
                Some(t) if Self::collectable(t) => {
                    t.invalidate();
                    self.threads.remove(id.0);
                    freed.push(id);
                }
                Some(_) => keep.push(id),
                None => {}
            }
        }
        self.dead = keep;
        freed
    }

    /// Waits for `target` to terminate and takes its exit value.
    ///
    /// Re-issue after every wake: the target may have exited, been
    /// detached, or been joined by someone else meanwhile.
    pub fn join(&mut self, me: ThreadId, target: ThreadId) -> Result<Step<usize>> {
        if me == target {
            return Err(Errno::EDEADLK);
        }
        let Some(t) = self.threads.get_mut(target.0) else {
            return Err(Errno::ESRCH);
        };
        if t.detached {
            return Err(Errno::EINVAL);
        }
        if t.joined {
            return Err(Errno::ESRCH);
        }
        if t.slot == WaitSlot::Join(me) {
            return Err(Errno::EDEADLK);
        }
        if t.state == ThreadState::Dead {
            t.joined = true;
            let value = t.exit_value.unwrap_or(0);
            self.notify_gc();
            return Ok(Step::Done(value));
        }
        t.join_waiters.push_back(me);
        self.park(me, ThreadState::Join, WaitSlot::Join(target), None);
        Ok(Step::Blocked)
    }

    pub fn detach(&mut self, target: ThreadId) -> Result<()> {
        let Some(t) = self.threads.get_mut(target.0) else {
            return Err(Errno::ESRCH);
        };
        if t.detached {
            return Err(Errno::EINVAL);
        }
        if t.joined {
            return Err(Errno::ESRCH);
        }
        t.detached = true;
        let dead = t.state == ThreadState::Dead;
        let joiners = t.join_waiters.drain();
        for joiner in joiners {
            self.wake(joiner, WakeReason::Notified);
        }
        if dead {
            self.notify_gc();
        }
        Ok(())
    }

    /// Requests cancellation of `target`. A target blocked at a
    /// cancellation point is woken so it can act on the request.
    pub fn cancel(&mut self, target: ThreadId) -> Result<()> {
        let t = self.live_tcb(target)?;
        let wake = t.cancel_state == CancelState::Enabled
            && t.state.is_wait()
            && is_cancellation_point(t.slot);
        if let Some(t) = self.threads.get_mut(target.0) {
            t.cancel_pending = true;
        }
        if wake {
            self.wake(target, WakeReason::Canceled);
        }
        Ok(())
    }

    /// At a cancellation point: returns true if the caller must now exit
    /// as canceled. The request is consumed.
    pub fn take_cancel(&mut self, me: ThreadId) -> bool {
        match self.threads.get_mut(me.0) {
            Some(t) if t.cancel_actionable() => {
                t.cancel_pending = false;
                t.exiting = true;
                true
            }
            _ => false,
        }
    }

    /// Asynchronous cancellation due at the next resume or safe point.
    #[must_use]
    pub fn async_cancel_due(&self, me: ThreadId) -> bool {
        self.tcb(me)
            .is_some_and(|t| t.cancel_actionable() && t.cancel_type == CancelType::Asynchronous)
    }

    pub fn set_cancel_state(&mut self, me: ThreadId, state: CancelState) -> Result<CancelState> {
        let t = self.threads.get_mut(me.0).ok_or(Errno::ESRCH)?;
        Ok(std::mem::replace(&mut t.cancel_state, state))
    }

    pub fn set_cancel_type(&mut self, me: ThreadId, kind: CancelType) -> Result<CancelType> {
        let t = self.threads.get_mut(me.0).ok_or(Errno::ESRCH)?;
        Ok(std::mem::replace(&mut t.cancel_type, kind))
    }

    /// Suspends `target`. A waiting target is marked and parks suspended
    /// once its wait completes; suspending oneself requires a dispatch.
    pub fn suspend(&mut self, target: ThreadId) -> Result<()> {
        let state = self.live_tcb(target)?.state;
        match state {
            ThreadState::Suspended => {}
            ThreadState::Running => {
                self.unlink(target);
                if let Some(t) = self.threads.get_mut(target.0) {
                    t.state = ThreadState::Suspended;
                    if self.current == Some(target) {
                        t.context.capture(crate::context::ContextKind::Cooperative);
                    }
                }
            }
            _ => {
                if let Some(t) = self.threads.get_mut(target.0) {
                    t.suspend = SuspendMode::Pending;
                }
            }
        }
        Ok(())
    }

    pub fn resume(&mut self, target: ThreadId) -> Result<()> {
        let state = self.live_tcb(target)?.state;
        if state == ThreadState::Suspended {
            self.enqueue_ready(target);
        } else if let Some(t) = self.threads.get_mut(target.0) {
            t.suspend = SuspendMode::None;
        }
        Ok(())
    }

    pub fn set_schedparam(&mut self, target: ThreadId, policy: SchedPolicy, priority: u8) -> Result<()> {
        check_priority(priority)?;
        self.live_tcb(target)?;
        if let Some(t) = self.threads.get_mut(target.0) {
            t.policy = policy;
            t.base_priority = priority;
            if policy == SchedPolicy::Fifo {
                t.slice_deadline = None;
            }
        }
        self.refresh_priority(target);
        Ok(())
    }

    pub fn get_schedparam(&self, target: ThreadId) -> Result<(SchedPolicy, u8)> {
        let t = self.live_tcb(target)?;
        Ok((t.policy, t.base_priority))
    }

    pub fn set_name(&mut self, target: ThreadId, name: Option<String>) -> Result<()> {
        self.live_tcb(target)?;
        if let Some(t) = self.threads.get_mut(target.0) {
            t.name = name;
        }
        Ok(())
    }
}

/// Waits a deferred cancellation request may break.
fn is_cancellation_point(slot: WaitSlot) -> bool {
    matches!(
        slot,
        WaitSlot::Cond(_)
            | WaitSlot::Sem(_)
            | WaitSlot::Join(_)
            | WaitSlot::FdLock(..)
            | WaitSlot::Io
            | WaitSlot::Sleep
            | WaitSlot::Signal
            | WaitSlot::Child
    )
}
