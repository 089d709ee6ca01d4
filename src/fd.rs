//! Owning handle for a file descriptor that may participate in the event
//! loop (socket, eventfd, signalfd, timerfd). Grounded on
//! `mio/src/sys/unix/io.rs` and `mio/src/sys/unix/sourcefd.rs`'s
//! close-on-drop ownership pattern.

use std::os::unix::io::{AsRawFd, RawFd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    Socket,
    Wakeup,
    Signal,
    Timer,
}

/// Exclusive owner of a non-negative fd. Closes it on drop, ignoring
/// `EINTR`; other errno on close is logged but not fatal outside debug
/// builds (a double-close is a programmer error, see spec §7).
#[derive(Debug)]
pub struct SelectableFd {
    fd: RawFd,
    kind: FdKind,
}

impl SelectableFd {
    /// # Safety
    /// `fd` must be a valid, open, exclusively-owned file descriptor.
    pub unsafe fn from_raw(fd: RawFd, kind: FdKind) -> Self {
        assert!(fd >= 0, "SelectableFd requires a non-negative fd");
        SelectableFd { fd, kind }
    }

    pub fn kind(&self) -> FdKind {
        self.kind
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Consumes `self` without closing the fd, returning it to the caller.
    pub fn into_raw(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        unsafe {
            let flags = libc::fcntl(self.fd, libc::F_GETFL, 0);
            if flags < 0 {
                return Err(std::io::Error::last_os_error());
            }
            let flags = if nonblocking {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            };
            if libc::fcntl(self.fd, libc::F_SETFL, flags) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

impl AsRawFd for SelectableFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for SelectableFd {
    fn drop(&mut self) {
        if self.fd < 0 {
            return;
        }
        loop {
            let rc = unsafe { libc::close(self.fd) };
            if rc == 0 {
                break;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            #[cfg(debug_assertions)]
            if err.raw_os_error() != Some(libc::EBADF) {
                debug_assert!(false, "SelectableFd close failed: {err}");
            }
            break;
        }
    }
}
