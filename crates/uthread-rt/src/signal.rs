//! Signals for green threads.
//!
//! Masks, pending sets and dispositions are per runtime; handlers run on
//! the receiving green thread at its next safe point. OS deliveries reach
//! the runtime only for signals passed to [`install_process_handler`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use serde_json::json;
use uthread_core::signal::{self as sig, Disposition};
use uthread_core::{Errno, Result, SigAction, SigHow, SigSet, Signal, Step, ThreadId, WakeReason};

use crate::log::{LogEntry, LogLevel};
use crate::runtime::{CANCEL_NOW, Shared, with_runtime};

pub use uthread_core::signal::{
    SIGALRM, SIGCHLD, SIGHUP, SIGINT, SIGPIPE, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2,
};

static OS_PENDING: AtomicU64 = AtomicU64::new(0);
static OS_NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_os_signal(signo: libc::c_int) {
    // SAFETY: errno is thread-local; it is saved and restored around the
    // write so the interrupted code does not observe a change.
    let saved = unsafe { *libc::__errno_location() };
    if (1..=64).contains(&signo) {
        OS_PENDING.fetch_or(1u64 << (signo - 1), Ordering::SeqCst);
    }
    let fd = OS_NOTIFY_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 1u8;
        // SAFETY: write(2) is async-signal-safe; the buffer is a live local.
        let _ = unsafe { libc::write(fd, (&raw const byte).cast(), 1) };
    }
    // SAFETY: see above.
    unsafe { *libc::__errno_location() = saved };
}

pub(crate) fn take_os_signals() -> SigSet {
    SigSet::from_bits(OS_PENDING.swap(0, Ordering::SeqCst))
}

/// Stops routing OS deliveries to `shared` once its run is over.
pub(crate) fn release_os_intake(shared: &Arc<Shared>) {
    if shared.os_intake.swap(false, Ordering::AcqRel) {
        let _ = OS_NOTIFY_FD.compare_exchange(
            shared.pipe.write_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

/// Points the OS handler at a new notification pipe after `fork`.
pub(crate) fn rebind_os_intake(shared: &Shared) {
    if shared.os_intake.load(Ordering::Acquire) {
        OS_NOTIFY_FD.store(shared.pipe.write_fd(), Ordering::SeqCst);
    }
}

/// What to do when a signal reaches a thread that does not block it.
#[derive(Clone)]
pub enum SigHandler {
    Default,
    Ignore,
    Catch(Arc<dyn Fn(Signal) + Send + Sync>),
}

impl SigHandler {
    /// Wraps a closure as a catching handler.
    pub fn catch(f: impl Fn(Signal) + Send + Sync + 'static) -> Self {
        SigHandler::Catch(Arc::new(f))
    }
}

impl std::fmt::Debug for SigHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigHandler::Default => f.write_str("Default"),
            SigHandler::Ignore => f.write_str("Ignore"),
            SigHandler::Catch(_) => f.write_str("Catch(..)"),
        }
    }
}

/// Installs the disposition of `signo`; `mask` is blocked in addition to
/// the signal itself while a catching handler runs. Returns the previous
/// disposition.
pub fn sigaction(signo: Signal, handler: SigHandler, mask: SigSet) -> Result<Disposition> {
    with_runtime(|shared, g, _| {
        let action = match &handler {
            SigHandler::Default => SigAction::default(),
            SigHandler::Ignore => SigAction::ignore(),
            SigHandler::Catch(_) => SigAction::catch(mask),
        };
        let old = g.sched.sigaction(signo, action)?;
        match handler {
            SigHandler::Catch(f) => {
                g.handlers.insert(signo, f);
            }
            SigHandler::Default | SigHandler::Ignore => {
                g.handlers.remove(&signo);
            }
        }
        if shared.logs(LogLevel::Debug) {
            shared.log(LogEntry::new("", LogLevel::Debug, "signal.action").with_details(json!({
                "signal": signo,
                "disposition": action.disposition,
            })));
        }
        Ok(old.disposition)
    })
}

/// Examines and changes the calling thread's blocked set.
pub fn sigmask(how: SigHow, set: Option<SigSet>) -> Result<SigSet> {
    with_runtime(|_, g, me| g.sched.sigmask(me, how, set))
}

/// Directs `signo` at one thread. Signal 0 checks that it exists.
pub fn kill(target: ThreadId, signo: Signal) -> Result<()> {
    with_runtime(|_, g, _| g.sched.kill(target, signo))
}

/// Raises a process-directed signal from inside the runtime.
pub fn raise(signo: Signal) -> Result<()> {
    with_runtime(|shared, g, _| {
        sig::validate(signo)?;
        shared.route_process_signal(g, signo, "raise");
        Ok(())
    })
}

/// Waits for a member of `set` and accepts it without running a handler.
pub fn sigwait(set: SigSet) -> Result<Signal> {
    with_runtime(|shared, g, me| loop {
        if g.sched.take_cancel(me) {
            return Err(CANCEL_NOW);
        }
        match g.sched.sigwait(me, set)? {
            Step::Done(signo) => return Ok(signo),
            Step::Blocked => match shared.block(g, me) {
                WakeReason::Accepted(signo) => return Ok(signo),
                WakeReason::Canceled => return Err(CANCEL_NOW),
                _ => {}
            },
        }
    })
}

/// Replaces the mask with `mask` until a handler has run, then restores
/// it. Always fails with `EINTR`, as the call only returns after a signal.
pub fn sigsuspend(mask: SigSet) -> Result<()> {
    with_runtime(|shared, g, me| {
        if g.sched.take_cancel(me) {
            return Err(CANCEL_NOW);
        }
        let woke = match g.sched.sigsuspend(me, mask) {
            Step::Done(()) => WakeReason::Notified,
            Step::Blocked => shared.block(g, me),
        };
        shared.deliver_signals(g, me);
        g.sched.end_sigsuspend(me);
        if woke == WakeReason::Canceled {
            return Err(CANCEL_NOW);
        }
        Err(Errno::EINTR)
    })
}

/// Signals raised for the calling thread or the process and not yet
/// delivered.
pub fn sigpending() -> Result<SigSet> {
    with_runtime(|_, g, me| Ok(g.sched.sigpending(me)))
}

/// Routes OS deliveries of `signo` into the calling thread's runtime as
/// process-directed signals. Only one runtime in a process can receive OS
/// signals at a time.
pub fn install_process_handler(signo: Signal) -> Result<()> {
    with_runtime(|shared, g, _| {
        sig::validate(signo)?;
        if sig::is_unblockable(signo) {
            return Err(Errno::EINVAL);
        }
        let fd = shared.pipe.write_fd();
        let owner = OS_NOTIFY_FD.load(Ordering::SeqCst);
        if owner >= 0 && owner != fd {
            return Err(Errno::EBUSY);
        }
        OS_NOTIFY_FD.store(fd, Ordering::SeqCst);
        shared.os_intake.store(true, Ordering::Release);
        g.sched.set_external_signals(true);

        // SAFETY: installs a handler that only touches atomics and write(2).
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_os_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signo, &action, std::ptr::null_mut())
        };
        if rc != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL);
            return Err(Errno::from_raw(errno));
        }
        if shared.logs(LogLevel::Info) {
            shared.log(
                LogEntry::new("", LogLevel::Info, "signal.intake").with_details(json!({ "signal": signo })),
            );
        }
        Ok(())
    })
}

/// Enters a critical section: preemption requests are held back and
/// handlers wait until the matching [`undefer_signals`].
pub fn defer_signals() -> Result<()> {
    with_runtime(|_, g, me| {
        g.sched.defer_signals(me);
        Ok(())
    })
}

/// Leaves a critical section; at depth zero a held-back yield is taken
/// and pending handlers run.
pub fn undefer_signals() -> Result<()> {
    with_runtime(|shared, g, me| {
        if g.sched.undefer_signals(me) {
            shared.yield_now(g, me, uthread_core::Relinquish::Preempt);
        }
        Ok(())
    })
}
