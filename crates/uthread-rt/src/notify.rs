//! Self-pipe used to interrupt the idle `poll(2)`.

use std::sync::atomic::{AtomicI32, Ordering};

use uthread_core::Errno;

#[derive(Debug)]
pub(crate) struct NotifyPipe {
    read: AtomicI32,
    write: AtomicI32,
}

fn last_errno() -> Errno {
    Errno::from_raw(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
}

fn open_pair() -> Result<(i32, i32), Errno> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a valid two-element array for pipe2 to fill.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(last_errno());
    }
    Ok((fds[0], fds[1]))
}

impl NotifyPipe {
    pub(crate) fn new() -> Result<Self, Errno> {
        let (read, write) = open_pair()?;
        Ok(Self {
            read: AtomicI32::new(read),
            write: AtomicI32::new(write),
        })
    }

    pub(crate) fn read_fd(&self) -> i32 {
        self.read.load(Ordering::Acquire)
    }

    pub(crate) fn write_fd(&self) -> i32 {
        self.write.load(Ordering::Acquire)
    }

    /// Wakes an idle poller. A full pipe already guarantees a wake-up.
    pub(crate) fn notify(&self) {
        let byte = 1u8;
        // SAFETY: writes one byte from a live stack value to our own fd.
        let _ = unsafe { libc::write(self.write_fd(), (&raw const byte).cast(), 1) };
    }

    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: `buf` outlives the call and its length is passed.
            let n = unsafe { libc::read(self.read_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Replaces both ends; used in a forked child so it stops sharing the
    /// parent's pipe.
    pub(crate) fn reopen(&self) -> Result<(), Errno> {
        let (read, write) = open_pair()?;
        let old_read = self.read.swap(read, Ordering::AcqRel);
        let old_write = self.write.swap(write, Ordering::AcqRel);
        // SAFETY: the old descriptors are owned by this pipe and no longer
        // published.
        unsafe {
            libc::close(old_read);
            libc::close(old_write);
        }
        Ok(())
    }
}

impl Drop for NotifyPipe {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by this pipe.
        unsafe {
            libc::close(*self.read.get_mut());
            libc::close(*self.write.get_mut());
        }
    }
}
