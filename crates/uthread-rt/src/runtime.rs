//! The switching engine.
//!
//! Every green thread is backed by an OS thread parked on its own condvar.
//! All of them share one lock around the [`Scheduler`]; a backing thread
//! proceeds only while the scheduler names it `current`, so exactly one
//! green thread executes at a time. When nothing is runnable the thread
//! that dispatched waits in `poll(2)` over blocked descriptors and the
//! notification pipe, with the lock released.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde_json::json;
use uthread_core::tcb::PRIO_MIN;
use uthread_core::{
    CANCELED, CancelState, CondId, Dispatch, Errno, MutexAttr, MutexId, Pending, PollEntry,
    Relinquish, Result, SigSet, Signal, Scheduler, ThreadAttr, ThreadId, ThreadInfo,
};

use crate::config::{LogTarget, Mode, RuntimeConfig};
use crate::error::RuntimeError;
use crate::log::{LogEmitter, LogEntry, LogLevel};
use crate::notify::NotifyPipe;

pub(crate) type Guard<'a> = MutexGuard<'a, Inner>;
pub(crate) type Handler = Arc<dyn Fn(Signal) + Send + Sync>;
pub(crate) type Entry = Box<dyn FnOnce() -> usize + Send>;

/// Returned by internal operations when the caller must unwind as
/// canceled; converted at the public boundary.
pub(crate) const CANCEL_NOW: Errno = Errno::ECANCELED;

/// Unwind payloads used to leave a thread's entry function.
pub(crate) struct ExitUnwind(pub(crate) usize);
pub(crate) struct CancelUnwind;
pub(crate) struct ShutdownUnwind;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) struct Inner {
    pub(crate) sched: Scheduler,
    pub(crate) parkers: HashMap<ThreadId, Arc<Condvar>>,
    pub(crate) os_threads: HashMap<ThreadId, JoinHandle<()>>,
    pub(crate) handlers: HashMap<Signal, Handler>,
    pub(crate) gc: Option<(MutexId, CondId)>,
    outcome: Option<std::result::Result<usize, RuntimeError>>,
    shutdown: bool,
}

pub(crate) struct Shared {
    inner: Mutex<Inner>,
    done: Condvar,
    pub(crate) config: RuntimeConfig,
    pub(crate) pipe: NotifyPipe,
    logger: Option<Mutex<LogEmitter>>,
    /// This runtime receives OS signal deliveries.
    pub(crate) os_intake: AtomicBool,
}

#[derive(Clone)]
pub(crate) struct Ctx {
    pub(crate) shared: Arc<Shared>,
    pub(crate) id: ThreadId,
}

thread_local! {
    static CURRENT: RefCell<Option<Ctx>> = const { RefCell::new(None) };
}

pub(crate) fn current_ctx() -> Result<Ctx> {
    CURRENT.with(|c| c.borrow().clone()).ok_or(Errno::EPERM)
}

fn set_ctx(ctx: Option<Ctx>) {
    CURRENT.with(|c| *c.borrow_mut() = ctx);
}

/// Runs `op` for the calling green thread under the runtime lock, then
/// settles: honors a pending preemption, runs deliverable signal handlers,
/// and acts on cancellation.
pub(crate) fn with_runtime<T>(
    op: impl FnOnce(&Arc<Shared>, &mut Guard<'_>, ThreadId) -> Result<T>,
) -> Result<T> {
    let ctx = current_ctx()?;
    let shared = &ctx.shared;
    let mut g = shared.lock();
    shared.intake(&mut g);
    let mut result = op(shared, &mut g, ctx.id);
    if result.as_ref().err() != Some(&CANCEL_NOW)
        && let Err(err) = shared.settle(&mut g, ctx.id)
    {
        result = Err(err);
    }
    drop(g);
    if result.as_ref().err() == Some(&CANCEL_NOW) {
        panic::resume_unwind(Box::new(CancelUnwind));
    }
    result
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

enum ThreadEnd {
    Returned(usize),
    Exited(usize),
    Canceled,
    Shutdown,
    Panicked(String),
}

fn classify(run: std::thread::Result<usize>) -> ThreadEnd {
    match run {
        Ok(value) => ThreadEnd::Returned(value),
        Err(payload) => {
            if let Some(ExitUnwind(value)) = payload.downcast_ref::<ExitUnwind>() {
                ThreadEnd::Exited(*value)
            } else if payload.is::<CancelUnwind>() {
                ThreadEnd::Canceled
            } else if payload.is::<ShutdownUnwind>() {
                ThreadEnd::Shutdown
            } else {
                ThreadEnd::Panicked(panic_message(&*payload))
            }
        }
    }
}

fn poll_timeout(deadline: Option<Instant>, now: Instant) -> libc::c_int {
    match deadline {
        None => -1,
        Some(deadline) => {
            let left = deadline.saturating_duration_since(now);
            let ms = left.as_nanos().div_ceil(1_000_000);
            libc::c_int::try_from(ms).unwrap_or(libc::c_int::MAX)
        }
    }
}

fn thread_main(shared: Arc<Shared>, me: ThreadId, entry: Entry) {
    set_ctx(Some(Ctx {
        shared: Arc::clone(&shared),
        id: me,
    }));
    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        let started = {
            let mut g = shared.lock();
            shared.wait_turn(&mut g, me);
            if shared.logs(LogLevel::Debug) {
                shared.log(LogEntry::new("", LogLevel::Debug, "thread.start").with_thread(me));
            }
            shared.settle(&mut g, me)
        };
        if started == Err(CANCEL_NOW) {
            panic::resume_unwind(Box::new(CancelUnwind));
        }
        entry()
    }));
    shared.conclude(me, classify(run));
    set_ctx(None);
}

impl Shared {
    pub(crate) fn lock(&self) -> Guard<'_> {
        self.inner.lock()
    }

    pub(crate) fn logs(&self, level: LogLevel) -> bool {
        self.logger.is_some() && level >= self.config.log_level
    }

    pub(crate) fn log(&self, entry: LogEntry) {
        if let Some(logger) = &self.logger {
            let _ = logger.lock().emit_entry(entry);
        }
    }

    pub(crate) fn flush_log(&self) {
        if let Some(logger) = &self.logger {
            let _ = logger.lock().flush();
        }
    }

    /// Parks the caller until it is the scheduler's current thread.
    pub(crate) fn wait_turn(&self, g: &mut Guard<'_>, me: ThreadId) {
        let parker = Arc::clone(g.parkers.entry(me).or_default());
        loop {
            if g.shutdown {
                panic::resume_unwind(Box::new(ShutdownUnwind));
            }
            if g.sched.current() == Some(me) {
                return;
            }
            parker.wait(g);
        }
    }

    /// Hands the CPU to whatever the scheduler picks next. With `me` set
    /// the caller is parked until it is picked again; an exited thread
    /// passes `None` and returns once somebody else runs.
    pub(crate) fn reschedule(&self, g: &mut Guard<'_>, me: Option<ThreadId>) {
        loop {
            self.poll_ready(g);
            let now = Instant::now();
            match g.sched.dispatch(now) {
                Dispatch::Run(next) => {
                    if self.config.mode == Mode::Hardened {
                        g.sched.assert_invariants();
                    }
                    if Some(next) == me {
                        return;
                    }
                    if self.logs(LogLevel::Trace) {
                        self.log(
                            LogEntry::new("", LogLevel::Trace, "sched.switch")
                                .with_thread(next)
                                .with_details(json!({ "from": me.map(|id| id.to_string()) })),
                        );
                    }
                    if let Some(parker) = g.parkers.get(&next) {
                        parker.notify_one();
                    }
                    if let Some(me) = me {
                        self.wait_turn(g, me);
                    }
                    return;
                }
                Dispatch::Idle { deadline } => self.idle(g, deadline),
                Dispatch::Deadlock => {
                    let blocked = g.sched.live_threads().len();
                    self.log(
                        LogEntry::new("", LogLevel::Error, "sched.deadlock")
                            .with_errno(Errno::EDEADLK)
                            .with_details(json!({ "blocked": blocked, "threads": g.sched.dump_info() })),
                    );
                    self.end_run(g, Err(RuntimeError::Deadlock { blocked }));
                    if me.is_some() {
                        panic::resume_unwind(Box::new(ShutdownUnwind));
                    }
                    return;
                }
                Dispatch::Exhausted => {
                    let main = g.sched.main_thread();
                    let value = g.sched.tcb(main).and_then(|t| t.exit_value).unwrap_or(0);
                    self.end_run(g, Ok(value));
                    if me.is_some() {
                        panic::resume_unwind(Box::new(ShutdownUnwind));
                    }
                    return;
                }
            }
        }
    }

    fn idle(&self, g: &mut Guard<'_>, deadline: Option<Instant>) {
        let timeout = poll_timeout(deadline, Instant::now());
        self.poll_descriptors(g, timeout);
        self.intake(g);
    }

    /// Non-blocking readiness pass over blocked descriptors, so a waiter
    /// whose descriptor became ready competes for the CPU even while other
    /// threads stay runnable.
    pub(crate) fn poll_ready(&self, g: &mut Guard<'_>) {
        if g.sched.has_io_waiters() {
            self.poll_descriptors(g, 0);
        }
    }

    /// Polls blocked descriptors for at most `timeout` milliseconds (-1
    /// waits indefinitely) and wakes the threads whose descriptors are
    /// ready. A blocking poll also watches the notification pipe and runs
    /// with the lock released. The zero-timeout pass leaves the pipe alone
    /// so its wakeup stays armed for the next idle poll.
    fn poll_descriptors(&self, g: &mut Guard<'_>, timeout: libc::c_int) {
        let blocking = timeout != 0;
        let interest = g.sched.io_interest();
        let mut fds: Vec<libc::pollfd> = interest
            .iter()
            .map(|e| libc::pollfd {
                fd: e.fd,
                events: e.events,
                revents: 0,
            })
            .collect();
        if blocking {
            fds.push(libc::pollfd {
                fd: self.pipe.read_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }
        let nfds = fds.len() as libc::nfds_t;
        let rc = if blocking {
            MutexGuard::unlocked(g, || {
                // SAFETY: `fds` is a live vector of `nfds` pollfd records.
                unsafe { libc::poll(fds.as_mut_ptr(), nfds, timeout) }
            })
        } else {
            // SAFETY: as above.
            unsafe { libc::poll(fds.as_mut_ptr(), nfds, 0) }
        };
        if rc <= 0 {
            return;
        }
        let mut polled = fds.as_slice();
        if blocking && let Some((wake, rest)) = polled.split_last() {
            if wake.revents != 0 {
                self.pipe.drain();
            }
            polled = rest;
        }
        let ready: Vec<PollEntry> = polled
            .iter()
            .filter(|p| p.revents != 0)
            .map(|p| PollEntry {
                fd: p.fd,
                events: p.events,
                revents: p.revents,
            })
            .collect();
        if ready.is_empty() {
            return;
        }
        let woken = g.sched.io_ready(&ready);
        if self.logs(LogLevel::Trace) {
            self.log(
                LogEntry::new("", LogLevel::Trace, "io.ready")
                    .with_details(json!({ "descriptors": ready.len(), "woken": woken })),
            );
        }
    }

    /// Routes OS signal deliveries collected since the last look.
    pub(crate) fn intake(&self, g: &mut Guard<'_>) {
        if !self.os_intake.load(Ordering::Acquire) {
            return;
        }
        for sig in crate::signal::take_os_signals().iter() {
            self.route_process_signal(g, sig, "os");
        }
    }

    pub(crate) fn route_process_signal(&self, g: &mut Guard<'_>, sig: Signal, source: &str) {
        match g.sched.raise_process(sig) {
            Ok(delivery) => {
                if self.logs(LogLevel::Debug) {
                    self.log(LogEntry::new("", LogLevel::Debug, "signal.raise").with_details(
                        json!({ "signal": sig, "source": source, "delivery": format!("{delivery:?}") }),
                    ));
                }
            }
            Err(errno) => self.log(
                LogEntry::new("", LogLevel::Warn, "signal.raise")
                    .with_errno(errno)
                    .with_details(json!({ "signal": sig, "source": source })),
            ),
        }
    }

    /// Work done at the end of every runtime call: readiness and expired
    /// timeouts are promoted before the preemption check.
    pub(crate) fn settle(&self, g: &mut Guard<'_>, me: ThreadId) -> Result<()> {
        self.poll_ready(g);
        let now = Instant::now();
        if g.sched.should_yield(now) {
            g.sched.relinquish(Relinquish::Preempt, now);
            self.reschedule(g, Some(me));
        }
        self.deliver_signals(g, me);
        if g.sched.async_cancel_due(me) && g.sched.take_cancel(me) {
            return Err(CANCEL_NOW);
        }
        Ok(())
    }

    /// Runs handlers for every signal `me` can take now, each inside a
    /// signal frame and with the runtime lock released.
    pub(crate) fn deliver_signals(&self, g: &mut Guard<'_>, me: ThreadId) {
        loop {
            if g.sched.tcb(me).is_none_or(|t| t.sig_defer > 0) {
                return;
            }
            let Some(pending) = g.sched.next_deliverable(me) else {
                return;
            };
            match pending {
                Pending::Handle(sig, _) => {
                    let Some(handler) = g.handlers.get(&sig).cloned() else {
                        continue;
                    };
                    g.sched.push_signal_frame(me, sig);
                    if self.logs(LogLevel::Debug) {
                        self.log(
                            LogEntry::new("", LogLevel::Debug, "signal.deliver")
                                .with_thread(me)
                                .with_details(json!({ "signal": sig })),
                        );
                    }
                    let run = MutexGuard::unlocked(g, || {
                        panic::catch_unwind(AssertUnwindSafe(|| handler(sig)))
                    });
                    g.sched.pop_signal_frame(me);
                    if let Err(payload) = run {
                        panic::resume_unwind(payload);
                    }
                }
                Pending::Terminate(sig) => self.terminate(me, sig),
            }
        }
    }

    /// Default action of a fatal signal: the whole process dies of it.
    fn terminate(&self, me: ThreadId, sig: Signal) -> ! {
        self.log(
            LogEntry::new("", LogLevel::Error, "signal.terminate")
                .with_thread(me)
                .with_details(json!({ "signal": sig })),
        );
        self.flush_log();
        // SAFETY: restores the default action and re-raises; the process is
        // expected to die here.
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, sig);
            libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
        std::process::exit(128 + sig)
    }

    /// Parks `me` in the wait it was just linked into and reports why it
    /// woke.
    pub(crate) fn block(&self, g: &mut Guard<'_>, me: ThreadId) -> uthread_core::WakeReason {
        if self.logs(LogLevel::Trace)
            && let Some(t) = g.sched.tcb(me)
        {
            self.log(
                LogEntry::new("", LogLevel::Trace, "sched.block")
                    .with_thread(me)
                    .with_details(json!({ "state": t.state.name() })),
            );
        }
        self.reschedule(g, Some(me));
        g.sched
            .tcb_mut(me)
            .map(|t| t.take_wake())
            .unwrap_or_default()
    }

    pub(crate) fn yield_now(&self, g: &mut Guard<'_>, me: ThreadId, how: Relinquish) {
        g.sched.relinquish(how, Instant::now());
        self.reschedule(g, Some(me));
    }

    /// Creates a green thread and its backing OS thread.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        g: &mut Guard<'_>,
        creator: Option<ThreadId>,
        attr: &ThreadAttr,
        entry: Entry,
    ) -> Result<ThreadId> {
        let id = g.sched.spawn(creator, attr)?;
        g.parkers.insert(id, Arc::new(Condvar::new()));
        let stack_size = attr.stack_size.unwrap_or(self.config.stack_size);
        let mut builder = std::thread::Builder::new().stack_size(stack_size);
        if let Some(name) = &attr.name {
            builder = builder.name(name.clone());
        }
        let shared = Arc::clone(self);
        match builder.spawn(move || thread_main(shared, id, entry)) {
            Ok(handle) => {
                g.os_threads.insert(id, handle);
                if self.logs(LogLevel::Info) {
                    let (policy, priority) = g.sched.get_schedparam(id).unwrap_or_default();
                    self.log(LogEntry::new("", LogLevel::Info, "thread.create").with_thread(id).with_details(
                        json!({
                            "name": attr.name,
                            "priority": priority,
                            "policy": policy,
                            "detached": attr.detached,
                            "suspended": attr.suspended,
                            "daemon": attr.daemon,
                        }),
                    ));
                }
                Ok(id)
            }
            Err(err) => {
                g.parkers.remove(&id);
                g.sched.discard_unstarted(id);
                self.log(
                    LogEntry::new("", LogLevel::Warn, "thread.create")
                        .with_errno(Errno::EAGAIN)
                        .with_details(json!({ "os_error": err.to_string() })),
                );
                Err(Errno::EAGAIN)
            }
        }
    }

    fn conclude(&self, me: ThreadId, end: ThreadEnd) {
        let value = match end {
            ThreadEnd::Returned(value) => value,
            ThreadEnd::Exited(value) => {
                if !crate::thread::run_cleanup_handlers() {
                    return;
                }
                value
            }
            ThreadEnd::Canceled => {
                if !crate::thread::run_cleanup_handlers() {
                    return;
                }
                CANCELED
            }
            ThreadEnd::Shutdown => return,
            ThreadEnd::Panicked(message) => {
                self.fail(me, message);
                return;
            }
        };
        let finished = panic::catch_unwind(AssertUnwindSafe(|| self.finish(me, value)));
        if let Err(payload) = finished
            && !payload.is::<ShutdownUnwind>()
        {
            self.fail(me, panic_message(&*payload));
        }
    }

    fn fail(&self, me: ThreadId, message: String) {
        let mut g = self.lock();
        self.log(
            LogEntry::new("", LogLevel::Error, "thread.panic")
                .with_thread(me)
                .with_details(json!({ "message": message })),
        );
        self.end_run(&mut g, Err(RuntimeError::Panicked { thread: me, message }));
    }

    fn finish(&self, me: ThreadId, value: usize) {
        let mut g = self.lock();
        if g.shutdown || g.sched.current() != Some(me) {
            return;
        }
        g.sched.exit_current(value);
        if self.logs(LogLevel::Info) {
            let canceled = value == CANCELED;
            self.log(
                LogEntry::new("", LogLevel::Info, "thread.exit")
                    .with_thread(me)
                    .with_details(json!({ "value": value, "canceled": canceled })),
            );
        }
        self.reschedule(&mut g, None);
    }

    fn end_run(&self, g: &mut Guard<'_>, outcome: std::result::Result<usize, RuntimeError>) {
        if g.outcome.is_none() {
            g.outcome = Some(outcome);
        }
        g.shutdown = true;
        for parker in g.parkers.values() {
            parker.notify_all();
        }
        self.done.notify_all();
    }

    /// Starts the daemon that frees the resources of dead threads.
    pub(crate) fn start_gc(self: &Arc<Self>, g: &mut Guard<'_>) -> Result<ThreadId> {
        let mutex = g.sched.mutex_init(MutexAttr::default())?;
        let cond = g.sched.cond_init();
        g.sched.set_gc_cond(cond);
        g.gc = Some((mutex, cond));
        let attr = ThreadAttr {
            name: Some("uthread-gc".to_string()),
            priority: PRIO_MIN,
            daemon: true,
            ..ThreadAttr::default()
        };
        let shared = Arc::clone(self);
        let id = self.spawn(
            g,
            None,
            &attr,
            Box::new(move || {
                let me = current_ctx().map(|ctx| ctx.id);
                match me {
                    Ok(me) => shared.gc_main(me, mutex, cond),
                    Err(_) => 0,
                }
            }),
        )?;
        if let Some(t) = g.sched.tcb_mut(id) {
            t.sig_mask = SigSet::FULL.maskable();
            t.cancel_state = CancelState::Disabled;
        }
        Ok(id)
    }

    fn gc_main(&self, me: ThreadId, mutex: MutexId, cond: CondId) -> usize {
        loop {
            let handles = {
                let mut g = self.lock();
                match self.collect_garbage(&mut g, me, mutex, cond) {
                    Ok(handles) => handles,
                    Err(errno) => {
                        self.log(LogEntry::new("", LogLevel::Warn, "gc.collect").with_errno(errno));
                        Vec::new()
                    }
                }
            };
            for handle in handles {
                let _ = handle.join();
            }
        }
    }

    fn collect_garbage(
        &self,
        g: &mut Guard<'_>,
        me: ThreadId,
        mutex: MutexId,
        cond: CondId,
    ) -> Result<Vec<JoinHandle<()>>> {
        self.mutex_lock(g, me, mutex)?;
        while !g.sched.has_garbage() {
            let waited = self.cond_wait(g, me, cond, mutex, None);
            if let Err(errno) = waited
                && errno != Errno::EINTR
            {
                let _ = g.sched.mutex_unlock(me, mutex);
                return Err(errno);
            }
        }
        let freed = g.sched.collect_garbage();
        let mut handles = Vec::with_capacity(freed.len());
        for id in &freed {
            g.parkers.remove(id);
            if let Some(handle) = g.os_threads.remove(id) {
                handles.push(handle);
            }
        }
        if self.logs(LogLevel::Debug) {
            let ids: Vec<String> = freed.iter().map(ToString::to_string).collect();
            self.log(LogEntry::new("", LogLevel::Debug, "gc.collect").with_details(json!({ "freed": ids })));
        }
        g.sched.mutex_unlock(me, mutex)?;
        Ok(handles)
    }
}

/// A cooperative threads runtime.
///
/// [`block_on`](Runtime::block_on) turns the calling OS thread into the
/// runtime's main thread; threads created from inside run interleaved with
/// it, one at a time, in priority order.
pub struct Runtime {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("mode", &self.shared.config.mode)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> std::result::Result<Self, RuntimeError> {
        let run_id = format!(
            "uthread-{}-{}",
            std::process::id(),
            RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let logger = match &config.log {
            LogTarget::Off => None,
            LogTarget::Stderr => Some(LogEmitter::to_stderr(&run_id, config.log_level)),
            LogTarget::File(path) => Some(
                LogEmitter::to_file(path, &run_id, config.log_level).map_err(|err| {
                    Errno::from_raw(err.raw_os_error().unwrap_or(libc::EIO))
                })?,
            ),
        };
        let pipe = NotifyPipe::new()?;
        let sched = Scheduler::new(config.sched_config(), Instant::now());
        let main = sched.main_thread();
        let mut parkers = HashMap::new();
        parkers.insert(main, Arc::new(Condvar::new()));
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                sched,
                parkers,
                os_threads: HashMap::new(),
                handlers: HashMap::new(),
                gc: None,
                outcome: None,
                shutdown: false,
            }),
            done: Condvar::new(),
            config,
            pipe,
            logger: logger.map(Mutex::new),
            os_intake: AtomicBool::new(false),
        });
        shared.log(LogEntry::new("", LogLevel::Info, "runtime.start").with_details(json!({
            "mode": shared.config.mode.label(),
            "quantum_ms": u64::try_from(shared.config.quantum.as_millis()).unwrap_or(u64::MAX),
            "stack_size": shared.config.stack_size,
            "fd_table_size": shared.config.fd_table_size,
        })));
        Ok(Self { shared })
    }

    /// Builds a runtime from [`RuntimeConfig::from_env`].
    pub fn from_env() -> std::result::Result<Self, RuntimeError> {
        Self::new(RuntimeConfig::from_env())
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// A handle usable from OS threads outside the runtime. While one
    /// exists, an all-blocked runtime waits for it instead of reporting a
    /// deadlock.
    #[must_use]
    pub fn handle(&self) -> RuntimeHandle {
        self.shared.lock().sched.set_external_signals(true);
        RuntimeHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs `main` as the main thread until the run ends.
    ///
    /// Returning from `main` ends the run at once, like returning from a C
    /// `main`; leaving it through [`exit`](crate::thread::exit) lets the
    /// other threads finish first, and the run ends when no non-daemon
    /// thread is left.
    pub fn block_on<F>(self, main: F) -> std::result::Result<usize, RuntimeError>
    where
        F: FnOnce() -> usize,
    {
        if current_ctx().is_ok() {
            return Err(RuntimeError::Nested);
        }
        let shared = self.shared;
        let me = {
            let mut g = shared.lock();
            shared.start_gc(&mut g)?;
            g.sched.main_thread()
        };
        set_ctx(Some(Ctx {
            shared: Arc::clone(&shared),
            id: me,
        }));

        let run = panic::catch_unwind(AssertUnwindSafe(main));
        match classify(run) {
            ThreadEnd::Returned(value) => {
                let mut g = shared.lock();
                shared.end_run(&mut g, Ok(value));
            }
            end => shared.conclude(me, end),
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut g = shared.lock();
            while !g.shutdown {
                shared.done.wait(&mut g);
            }
            g.os_threads.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        set_ctx(None);
        crate::signal::release_os_intake(&shared);

        let (outcome, dispatches) = {
            let mut g = shared.lock();
            (g.outcome.take().unwrap_or(Ok(0)), g.sched.dispatch_count())
        };
        shared.log(LogEntry::new("", LogLevel::Info, "runtime.end").with_details(json!({
            "dispatches": dispatches,
            "outcome": match &outcome {
                Ok(value) => json!({ "value": value }),
                Err(err) => json!({ "error": err.to_string() }),
            },
        })));
        shared.flush_log();
        outcome
    }
}

/// Access to a runtime from outside its threads.
#[derive(Clone)]
pub struct RuntimeHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle").finish_non_exhaustive()
    }
}

impl RuntimeHandle {
    /// Raises a process-directed signal, as if it came from the OS.
    pub fn raise(&self, sig: Signal) -> Result<()> {
        let mut g = self.shared.lock();
        uthread_core::signal::validate(sig)?;
        self.shared.route_process_signal(&mut g, sig, "handle");
        drop(g);
        self.shared.pipe.notify();
        Ok(())
    }

    #[must_use]
    pub fn dump_info(&self) -> Vec<ThreadInfo> {
        self.shared.lock().sched.dump_info()
    }

    #[must_use]
    pub fn dispatch_count(&self) -> u64 {
        self.shared.lock().sched.dispatch_count()
    }

    /// Whether the run has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.lock().shutdown
    }
}
