//! Deterministic kernel of the uthread M:1 threads runtime.
//!
//! Everything here is plain data and state transitions: thread control
//! blocks, the priority ready queue, wait queues, signal routing and the
//! synchronization objects, all owned by one [`Scheduler`]. No OS threads
//! and no syscalls; `uthread-rt` drives it under a lock and performs the
//! actual switches.

pub mod arena;
pub mod context;
pub mod errno;
pub mod pq;
pub mod queue;
pub mod sched;
pub mod signal;
pub mod tcb;

pub use errno::{Errno, Result};
pub use sched::cond::{CondId, cond_wait_result};
pub use sched::fdlock::{FdDirection, FdLockSnapshot};
pub use sched::io::PollEntry;
pub use sched::mutex::{MutexAttr, MutexId, MutexKind, MutexProtocol, MutexSnapshot};
pub use sched::rwlock::{RwLockId, RwLockSnapshot};
pub use sched::sem::{SEM_VALUE_MAX, SemId};
pub use sched::{
    Delivery, Dispatch, Pending, Relinquish, SchedConfig, Scheduler, Step, ThreadInfo,
    VIOLATION_PREFIX,
};
pub use signal::{SigAction, SigHow, SigSet, Signal};
pub use tcb::{
    CANCELED, CancelState, CancelType, SchedPolicy, ThreadAttr, ThreadId, ThreadState,
    WakeReason,
};
