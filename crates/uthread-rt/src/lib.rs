//! A cooperative M:1 threads runtime with a POSIX-style API.
//!
//! ```no_run
//! use uthread_rt::{Runtime, RuntimeConfig, thread};
//!
//! let rt = Runtime::new(RuntimeConfig::from_env()).expect("runtime");
//! let value = rt
//!     .block_on(|| {
//!         let worker = thread::create(|| 41).expect("create");
//!         thread::join(worker).expect("join") + 1
//!     })
//!     .expect("run");
//! assert_eq!(value, 42);
//! ```
//!
//! Every function in the API modules must be called from a thread of a
//! running [`Runtime`]; elsewhere it fails with `EPERM`.

pub mod config;
pub mod error;
pub mod fd;
pub mod io;
pub mod log;
mod notify;
pub mod process;
mod runtime;
pub mod signal;
pub mod sync;
pub mod thread;

pub use config::{LogTarget, Mode, RuntimeConfig};
pub use error::RuntimeError;
pub use log::{LogEmitter, LogEntry, LogLevel};
pub use runtime::{Runtime, RuntimeHandle};
pub use sync::{Cond, Mutex, RwLock, Semaphore};

pub use uthread_core::{
    CANCELED, CancelState, CancelType, Errno, FdDirection, FdLockSnapshot, MutexAttr, MutexKind,
    MutexProtocol, PollEntry, Result, SchedPolicy, SigHow, SigSet, Signal, ThreadId, ThreadInfo,
    ThreadState,
};
pub use uthread_core::signal::Disposition;
