use std::fmt;

use uthread_core::{Errno, ThreadId};

/// Why a run ended without a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    Errno(Errno),
    /// Every remaining thread waits on something nothing can provide.
    Deadlock { blocked: usize },
    /// A thread panicked; the run was torn down.
    Panicked { thread: ThreadId, message: String },
    /// `block_on` was called from a thread that already belongs to a runtime.
    Nested,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Errno(errno) => write!(f, "runtime setup failed: {errno}"),
            RuntimeError::Deadlock { blocked } => {
                write!(f, "deadlock: {blocked} thread(s) blocked with nothing runnable")
            }
            RuntimeError::Panicked { thread, message } => {
                write!(f, "thread {thread} panicked: {message}")
            }
            RuntimeError::Nested => f.write_str("block_on called from inside a runtime thread"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Errno(errno) => Some(errno),
            _ => None,
        }
    }
}

impl From<Errno> for RuntimeError {
    fn from(errno: Errno) -> Self {
        RuntimeError::Errno(errno)
    }
}
