//! Error numbers reported by the threads runtime.
//!
//! Every fallible operation returns an [`Errno`]; the integer values match
//! the Linux `<errno.h>` codes so they can be handed straight to callers that
//! expect POSIX return codes.

use std::fmt;

pub const EPERM: i32 = 1;
pub const ESRCH: i32 = 3;
pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const EBADF: i32 = 9;
pub const ECHILD: i32 = 10;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const EMFILE: i32 = 24;
pub const EPIPE: i32 = 32;
pub const EDEADLK: i32 = 35;
pub const ENOSYS: i32 = 38;
pub const EOVERFLOW: i32 = 75;
pub const ETIMEDOUT: i32 = 110;
pub const ECANCELED: i32 = 125;

/// Returns the error message string for the given errno value.
pub fn strerror_message(errnum: i32) -> &'static str {
    match errnum {
        0 => "Success",
        EPERM => "Operation not permitted",
        ESRCH => "No such process",
        EINTR => "Interrupted system call",
        EIO => "Input/output error",
        EBADF => "Bad file descriptor",
        ECHILD => "No child processes",
        EAGAIN => "Resource temporarily unavailable",
        ENOMEM => "Cannot allocate memory",
        EBUSY => "Device or resource busy",
        EINVAL => "Invalid argument",
        EMFILE => "Too many open files",
        EPIPE => "Broken pipe",
        EDEADLK => "Resource deadlock avoided",
        ENOSYS => "Function not implemented",
        EOVERFLOW => "Value too large for defined data type",
        ETIMEDOUT => "Connection timed out",
        ECANCELED => "Operation canceled",
        _ => "Unknown error",
    }
}

/// A POSIX error code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl Errno {
    pub const EPERM: Errno = Errno(EPERM);
    pub const ESRCH: Errno = Errno(ESRCH);
    pub const EINTR: Errno = Errno(EINTR);
    pub const EIO: Errno = Errno(EIO);
    pub const EBADF: Errno = Errno(EBADF);
    pub const ECHILD: Errno = Errno(ECHILD);
    pub const EAGAIN: Errno = Errno(EAGAIN);
    pub const EBUSY: Errno = Errno(EBUSY);
    pub const EINVAL: Errno = Errno(EINVAL);
    pub const EMFILE: Errno = Errno(EMFILE);
    pub const EDEADLK: Errno = Errno(EDEADLK);
    pub const ENOSYS: Errno = Errno(ENOSYS);
    pub const EOVERFLOW: Errno = Errno(EOVERFLOW);
    pub const ETIMEDOUT: Errno = Errno(ETIMEDOUT);
    pub const ECANCELED: Errno = Errno(ECANCELED);

    /// Wraps a raw code, e.g. one read back from the OS.
    #[must_use]
    pub const fn from_raw(code: i32) -> Self {
        Errno(code)
    }

    #[must_use]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[must_use]
    pub fn message(self) -> &'static str {
        strerror_message(self.0)
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({} {:?})", self.0, self.message())
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", self.message(), self.0)
    }
}

impl std::error::Error for Errno {}

pub type Result<T> = core::result::Result<T, Errno>;
