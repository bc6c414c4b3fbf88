//! Thread lifecycle for code running inside a runtime.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use serde_json::json;
use uthread_core::{
    CancelState, CancelType, Relinquish, Result, SchedPolicy, Step, ThreadAttr, ThreadId,
    ThreadInfo, WakeReason,
};

use crate::log::{LogEntry, LogLevel};
use crate::runtime::{CANCEL_NOW, ExitUnwind, ShutdownUnwind, with_runtime};

type Cleanup = Box<dyn FnOnce()>;

thread_local! {
    static CLEANUP: RefCell<Vec<Cleanup>> = const { RefCell::new(Vec::new()) };
}

/// Runs the calling thread's remaining cleanup handlers, newest first.
/// Returns false if the run was shut down meanwhile.
pub(crate) fn run_cleanup_handlers() -> bool {
    loop {
        let Some(handler) = CLEANUP.with(|c| c.borrow_mut().pop()) else {
            return true;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(handler))
            && payload.is::<ShutdownUnwind>()
        {
            CLEANUP.with(|c| c.borrow_mut().clear());
            return false;
        }
    }
}

/// Creation options for a green thread.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    attr: ThreadAttr,
}

impl Builder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.attr.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: u8) -> Self {
        self.attr.priority = priority;
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: SchedPolicy) -> Self {
        self.attr.policy = policy;
        self
    }

    /// Take priority and policy from the creating thread.
    #[must_use]
    pub fn inherit_sched(mut self) -> Self {
        self.attr.inherit_sched = true;
        self
    }

    #[must_use]
    pub fn detached(mut self) -> Self {
        self.attr.detached = true;
        self
    }

    /// Start suspended until [`resume`].
    #[must_use]
    pub fn suspended(mut self) -> Self {
        self.attr.suspended = true;
        self
    }

    /// Daemon threads do not keep the run alive.
    #[must_use]
    pub fn daemon(mut self) -> Self {
        self.attr.daemon = true;
        self
    }

    #[must_use]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.attr.stack_size = Some(bytes);
        self
    }

    /// Creates the thread. A new thread that outranks the caller runs
    /// before this returns.
    pub fn spawn<F>(self, f: F) -> Result<ThreadId>
    where
        F: FnOnce() -> usize + Send + 'static,
    {
        with_runtime(|shared, g, me| shared.spawn(g, Some(me), &self.attr, Box::new(f)))
    }
}

/// Creates a thread with default attributes.
pub fn create<F>(f: F) -> Result<ThreadId>
where
    F: FnOnce() -> usize + Send + 'static,
{
    Builder::new().spawn(f)
}

/// Terminates the calling thread with `value`. Pending cleanup handlers
/// run first.
pub fn exit(value: usize) -> ! {
    panic::resume_unwind(Box::new(ExitUnwind(value)))
}

/// Waits for `target` to terminate and returns its exit value
/// ([`CANCELED`](uthread_core::CANCELED) for a canceled thread).
pub fn join(target: ThreadId) -> Result<usize> {
    with_runtime(|shared, g, me| loop {
        if g.sched.take_cancel(me) {
            return Err(CANCEL_NOW);
        }
        match g.sched.join(me, target)? {
            Step::Done(value) => {
                if shared.logs(LogLevel::Info) {
                    shared.log(
                        LogEntry::new("", LogLevel::Info, "thread.join")
                            .with_thread(me)
                            .with_details(json!({ "target": target.to_string(), "value": value })),
                    );
                }
                return Ok(value);
            }
            Step::Blocked => {
                if shared.block(g, me) == WakeReason::Canceled {
                    return Err(CANCEL_NOW);
                }
            }
        }
    })
}

pub fn detach(target: ThreadId) -> Result<()> {
    with_runtime(|_, g, _| g.sched.detach(target))
}

/// Requests cancellation of `target`.
pub fn cancel(target: ThreadId) -> Result<()> {
    with_runtime(|shared, g, me| {
        g.sched.cancel(target)?;
        if shared.logs(LogLevel::Debug) {
            shared.log(
                LogEntry::new("", LogLevel::Debug, "thread.cancel")
                    .with_thread(me)
                    .with_details(json!({ "target": target.to_string() })),
            );
        }
        if target == me && g.sched.async_cancel_due(me) && g.sched.take_cancel(me) {
            return Err(CANCEL_NOW);
        }
        Ok(())
    })
}

/// A cancellation point and nothing else.
pub fn testcancel() {
    let _ = with_runtime(|_, g, me| {
        if g.sched.take_cancel(me) {
            return Err(CANCEL_NOW);
        }
        Ok(())
    });
}

pub fn set_cancel_state(state: CancelState) -> Result<CancelState> {
    with_runtime(|_, g, me| g.sched.set_cancel_state(me, state))
}

pub fn set_cancel_type(kind: CancelType) -> Result<CancelType> {
    with_runtime(|_, g, me| g.sched.set_cancel_type(me, kind))
}

/// Registers `f` to run if the thread exits or is canceled before the
/// matching [`cleanup_pop`].
pub fn cleanup_push(f: impl FnOnce() + 'static) {
    CLEANUP.with(|c| c.borrow_mut().push(Box::new(f)));
}

/// Removes the newest cleanup handler, running it when `execute` is set.
pub fn cleanup_pop(execute: bool) {
    let handler = CLEANUP.with(|c| c.borrow_mut().pop());
    if execute && let Some(handler) = handler {
        handler();
    }
}

/// Suspends `target`; suspending oneself returns once resumed.
pub fn suspend(target: ThreadId) -> Result<()> {
    with_runtime(|shared, g, me| {
        g.sched.suspend(target)?;
        if target == me {
            shared.reschedule(g, Some(me));
        }
        Ok(())
    })
}

pub fn resume(target: ThreadId) -> Result<()> {
    with_runtime(|_, g, _| g.sched.resume(target))
}

pub fn set_schedparam(target: ThreadId, policy: SchedPolicy, priority: u8) -> Result<()> {
    with_runtime(|_, g, _| g.sched.set_schedparam(target, policy, priority))
}

pub fn get_schedparam(target: ThreadId) -> Result<(SchedPolicy, u8)> {
    with_runtime(|_, g, _| g.sched.get_schedparam(target))
}

pub fn self_id() -> Result<ThreadId> {
    crate::runtime::current_ctx().map(|ctx| ctx.id)
}

/// Gives the CPU to the next thread of the same priority, if any.
pub fn yield_now() -> Result<()> {
    with_runtime(|shared, g, me| {
        shared.yield_now(g, me, Relinquish::Yield);
        Ok(())
    })
}

/// A safe point for long computations: switches away only when the time
/// slice ran out or a higher-priority thread is ready.
pub fn checkpoint() -> Result<()> {
    with_runtime(|_, _, _| Ok(()))
}

/// Busy-waits politely: the caller is runnable again at the next dispatch.
pub fn spin() -> Result<()> {
    with_runtime(|shared, g, me| {
        let _ = g.sched.spin_block(me);
        shared.reschedule(g, Some(me));
        Ok(())
    })
}

pub fn set_name(target: ThreadId, name: Option<String>) -> Result<()> {
    with_runtime(|_, g, _| g.sched.set_name(target, name))
}

pub fn name(target: ThreadId) -> Result<Option<String>> {
    with_runtime(|_, g, _| {
        g.sched
            .tcb(target)
            .map(|t| t.name.clone())
            .ok_or(uthread_core::Errno::ESRCH)
    })
}

/// One record per known thread, live ones first.
pub fn dump_info() -> Result<Vec<ThreadInfo>> {
    with_runtime(|_, g, _| Ok(g.sched.dump_info()))
}

/// Scheduler passes made by the calling thread's runtime so far.
pub fn dispatch_count() -> Result<u64> {
    with_runtime(|_, g, _| Ok(g.sched.dispatch_count()))
}
