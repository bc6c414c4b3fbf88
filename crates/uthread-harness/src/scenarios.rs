//! Built-in scheduling scenarios.
//!
//! Each scenario runs in a fresh runtime and records tags into a shared
//! trace; it passes when the recorded order matches the expected one and
//! the run ends cleanly.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uthread_rt::signal::{self, SIGUSR1, SigHandler};
use uthread_rt::sync::{Cond, Mutex, RwLock, Semaphore};
use uthread_rt::{
    CANCELED, Errno, FdDirection, MutexAttr, MutexProtocol, Result, Runtime, RuntimeConfig,
    RuntimeHandle, SigSet, fd, io, thread,
};

type Trace = Arc<StdMutex<Vec<String>>>;

/// What a scenario body gets to work with.
pub struct ScenarioCtx {
    trace: Trace,
    handle: RuntimeHandle,
}

impl ScenarioCtx {
    fn record(&self, tag: impl Into<String>) {
        push(&self.trace, tag);
    }

    fn tracer(&self) -> Trace {
        Arc::clone(&self.trace)
    }
}

fn push(trace: &Trace, tag: impl Into<String>) {
    trace
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(tag.into());
}

#[derive(Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub summary: &'static str,
    pub expected: &'static [&'static str],
    body: fn(&ScenarioCtx) -> Result<()>,
}

/// Outcome of one scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub mode: String,
    pub passed: bool,
    pub expected: Vec<String>,
    pub actual: Vec<String>,
    pub elapsed_us: u64,
    /// Why the run failed, when it did not end with exit value 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Scenario {
    #[must_use]
    pub fn run(&self, config: &RuntimeConfig) -> ScenarioResult {
        let trace: Trace = Arc::default();
        let start = Instant::now();
        let outcome = Runtime::new(config.clone()).and_then(|rt| {
            let ctx = ScenarioCtx {
                trace: Arc::clone(&trace),
                handle: rt.handle(),
            };
            let body = self.body;
            rt.block_on(move || match body(&ctx) {
                Ok(()) => 0,
                Err(errno) => usize::try_from(errno.raw()).unwrap_or(usize::MAX),
            })
        });
        let elapsed_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);

        let actual = trace.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let expected: Vec<String> = self.expected.iter().map(ToString::to_string).collect();
        let error = match outcome {
            Ok(0) => None,
            Ok(code) => Some(match i32::try_from(code) {
                Ok(raw) => format!("scenario failed: {}", Errno::from_raw(raw)),
                Err(_) => format!("scenario ended with exit value {code}"),
            }),
            Err(err) => Some(err.to_string()),
        };
        ScenarioResult {
            name: self.name.to_string(),
            mode: config.mode.label().to_string(),
            passed: error.is_none() && actual == expected,
            expected,
            actual,
            elapsed_us,
            error,
        }
    }
}

#[must_use]
pub fn all() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "priority_handoff",
            summary: "unlocking hands the CPU to the higher-priority mutex waiter, not a lower ready thread",
            expected: &["B", "C"],
            body: priority_handoff,
        },
        Scenario {
            name: "fd_lock_fifo",
            summary: "releasing a descriptor write lock wakes the writer that queued first",
            expected: &["first", "second"],
            body: fd_lock_fifo,
        },
        Scenario {
            name: "signal_during_sleep",
            summary: "a handled signal cuts a sleep short after the handler has run",
            expected: &["handled", "EINTR"],
            body: signal_during_sleep,
        },
        Scenario {
            name: "condvar_broadcast_fifo",
            summary: "broadcast wakes condition waiters in arrival order",
            expected: &["w1", "w2", "w3"],
            body: condvar_broadcast_fifo,
        },
        Scenario {
            name: "rwlock_writer_preference",
            summary: "a queued writer goes ahead of readers that arrive after it",
            expected: &["writer", "reader"],
            body: rwlock_writer_preference,
        },
        Scenario {
            name: "priority_inheritance",
            summary: "an inheriting mutex owner runs at its top waiter's priority",
            expected: &["boost=25", "high", "medium"],
            body: priority_inheritance,
        },
        Scenario {
            name: "cancel_cleanup",
            summary: "canceling a blocked thread runs its cleanup handlers",
            expected: &["cleanup", "canceled"],
            body: cancel_cleanup,
        },
        Scenario {
            name: "sleep_order",
            summary: "sleepers wake in deadline order",
            expected: &["short", "mid", "long"],
            body: sleep_order,
        },
    ]
}

#[must_use]
pub fn find(name: &str) -> Option<Scenario> {
    all().into_iter().find(|s| s.name == name)
}

fn priority_handoff(ctx: &ScenarioCtx) -> Result<()> {
    let m = Mutex::new(MutexAttr::default())?;
    m.lock()?;
    let tc = ctx.tracer();
    let c = thread::Builder::new().priority(10).name("C").spawn(move || {
        push(&tc, "C");
        0
    })?;
    let tb = ctx.tracer();
    let b = thread::Builder::new().priority(20).name("B").spawn(move || {
        if m.lock().is_ok() {
            push(&tb, "B");
            let _ = m.unlock();
        }
        0
    })?;
    m.unlock()?;
    thread::join(b)?;
    thread::join(c)?;
    Ok(())
}

fn fd_lock_fifo(ctx: &ScenarioCtx) -> Result<()> {
    let mut fds = [0; 2];
    // SAFETY: `fds` has room for the two descriptors.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Errno::EIO);
    }
    let [r, w] = fds;
    fd::fd_lock(w, FdDirection::Write, None)?;
    let mut writers = Vec::new();
    for tag in ["first", "second"] {
        let t = ctx.tracer();
        writers.push(thread::Builder::new().priority(20).spawn(move || {
            if fd::fd_lock(w, FdDirection::Write, None).is_ok() {
                push(&t, tag);
                let _ = fd::fd_unlock(w, FdDirection::Write);
            }
            0
        })?);
    }
    fd::fd_unlock(w, FdDirection::Write)?;
    for id in writers {
        thread::join(id)?;
    }
    fd::fd_close(w)?;
    fd::fd_close(r)
}

fn signal_during_sleep(ctx: &ScenarioCtx) -> Result<()> {
    let t = ctx.tracer();
    signal::sigaction(SIGUSR1, SigHandler::catch(move |_| push(&t, "handled")), SigSet::EMPTY)?;
    let handle = ctx.handle.clone();
    let raiser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        handle.raise(SIGUSR1)
    });
    let mut left = Duration::ZERO;
    match io::nanosleep(Duration::from_secs(10), Some(&mut left)) {
        Err(Errno::EINTR) if !left.is_zero() => ctx.record("EINTR"),
        Err(Errno::EINTR) => ctx.record("EINTR without remaining time"),
        Ok(()) => ctx.record("slept through"),
        Err(errno) => return Err(errno),
    }
    raiser.join().map_err(|_| Errno::EIO)?
}

fn condvar_broadcast_fifo(ctx: &ScenarioCtx) -> Result<()> {
    let m = Mutex::new(MutexAttr::default())?;
    let c = Cond::new()?;
    let mut waiters = Vec::new();
    for tag in ["w1", "w2", "w3"] {
        let t = ctx.tracer();
        waiters.push(thread::Builder::new().priority(20).spawn(move || {
            if m.lock().is_ok() {
                if c.wait(m).is_ok() {
                    push(&t, tag);
                }
                let _ = m.unlock();
            }
            0
        })?);
    }
    m.lock()?;
    c.broadcast()?;
    m.unlock()?;
    for id in waiters {
        thread::join(id)?;
    }
    Ok(())
}

fn rwlock_writer_preference(ctx: &ScenarioCtx) -> Result<()> {
    let rw = RwLock::new()?;
    rw.read()?;
    let tw = ctx.tracer();
    let writer = thread::Builder::new().priority(20).spawn(move || {
        if rw.write().is_ok() {
            push(&tw, "writer");
            let _ = rw.unlock();
        }
        0
    })?;
    let tr = ctx.tracer();
    let reader = thread::Builder::new().priority(20).spawn(move || {
        if rw.read().is_ok() {
            push(&tr, "reader");
            let _ = rw.unlock();
        }
        0
    })?;
    rw.unlock()?;
    thread::join(writer)?;
    thread::join(reader)?;
    Ok(())
}

fn active_priority_of_self() -> Result<u8> {
    let me = thread::self_id()?;
    thread::dump_info()?
        .into_iter()
        .find(|i| i.id == me)
        .map(|i| i.active_priority)
        .ok_or(Errno::ESRCH)
}

fn priority_inheritance(ctx: &ScenarioCtx) -> Result<()> {
    let m = Mutex::new(MutexAttr {
        protocol: MutexProtocol::Inherit,
        ..MutexAttr::default()
    })?;
    m.lock()?;
    let th = ctx.tracer();
    let high = thread::Builder::new().priority(25).spawn(move || {
        if m.lock().is_ok() {
            push(&th, "high");
            let _ = m.unlock();
        }
        0
    })?;
    ctx.record(format!("boost={}", active_priority_of_self()?));
    let tm = ctx.tracer();
    let medium = thread::Builder::new().priority(20).spawn(move || {
        push(&tm, "medium");
        0
    })?;
    m.unlock()?;
    thread::join(high)?;
    thread::join(medium)?;
    Ok(())
}

fn cancel_cleanup(ctx: &ScenarioCtx) -> Result<()> {
    let sem = Semaphore::new(false, 0)?;
    let t = ctx.tracer();
    let victim = thread::Builder::new().priority(20).spawn(move || {
        thread::cleanup_push(move || push(&t, "cleanup"));
        let _ = sem.wait();
        thread::cleanup_pop(false);
        0
    })?;
    thread::cancel(victim)?;
    if thread::join(victim)? == CANCELED {
        ctx.record("canceled");
    }
    sem.destroy()
}

fn sleep_order(ctx: &ScenarioCtx) -> Result<()> {
    let mut sleepers = Vec::new();
    for (tag, ms) in [("long", 30u64), ("short", 10), ("mid", 20)] {
        let t = ctx.tracer();
        sleepers.push(thread::create(move || {
            if io::sleep(Duration::from_millis(ms)).is_ok() {
                push(&t, tag);
            }
            0
        })?);
    }
    for id in sleepers {
        thread::join(id)?;
    }
    Ok(())
}
