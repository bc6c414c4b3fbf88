//! Process creation.

use std::sync::Arc;

use serde_json::json;
use uthread_core::{Result, ThreadId};

use crate::fd::last_errno;
use crate::log::{LogEntry, LogLevel};
use crate::runtime::{Guard, Shared, with_runtime};

impl Shared {
    /// Rebuilds the runtime around the one thread that survived `fork` in
    /// the child.
    fn reset_child(self: &Arc<Self>, g: &mut Guard<'_>, me: ThreadId) -> Result<()> {
        g.sched.reset_after_fork(me);
        g.parkers.retain(|id, _| *id == me);
        // The backing threads are gone; joining them would hang.
        for (_, handle) in g.os_threads.drain() {
            std::mem::forget(handle);
        }
        if let Some((mutex, cond)) = g.gc.take() {
            let _ = g.sched.cond_destroy(cond);
            let _ = g.sched.mutex_destroy(mutex);
        }
        self.pipe.reopen()?;
        crate::signal::rebind_os_intake(self);
        self.start_gc(g)?;
        Ok(())
    }
}

/// Forks the process. In the child only the calling thread exists; locks
/// held by other threads are released and their waiters forgotten.
/// Returns the child's pid in the parent and 0 in the child.
pub fn fork() -> Result<libc::pid_t> {
    with_runtime(|shared, g, me| {
        shared.flush_log();
        // SAFETY: the runtime lock is held, so no other green thread is
        // mid-transition; the child only touches state behind that lock.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(last_errno());
        }
        if pid == 0 {
            shared.reset_child(g, me)?;
        }
        if shared.logs(LogLevel::Info) {
            shared.log(
                LogEntry::new("", LogLevel::Info, "process.fork")
                    .with_thread(me)
                    .with_details(json!({ "pid": pid, "child": pid == 0 })),
            );
        }
        Ok(pid)
    })
}
