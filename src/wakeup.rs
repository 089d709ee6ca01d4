//! Cross-thread wake-up: an `eventfd` a foreign thread can write to force
//! a blocked `poll`/`epoll_wait` to return immediately. Grounded on
//! annety's `EventFd`-backed wakeup channel and on `mio`'s own `Waker`
//! (`src/sys/unix/waker/eventfd.rs`), which uses the same primitive for
//! the same reason.

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use crate::sys::syscall;

/// One end of an eventfd pair: `wake()` is `Send + Sync` and may be
/// called from any thread; the owning loop reads and discards the
/// accumulated count each time it drains its wake-ups.
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
        Ok(Waker { fd })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Forces the owning loop's next `poll` call to return. Coalesces:
    /// multiple wakes before the loop drains are observed as one.
    pub fn wake(&self) -> io::Result<()> {
        use std::os::unix::io::FromRawFd;
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        let mut file = unsafe { std::fs::File::from_raw_fd(self.fd) };
        let res = file.write_all(&buf);
        std::mem::forget(file);
        res
    }

    /// Clears the counter so the fd stops reporting readable. Called once
    /// per loop iteration after the poller reports this fd ready.
    pub fn drain(&self) -> io::Result<()> {
        use std::os::unix::io::FromRawFd;
        let mut buf = [0u8; 8];
        let mut file = unsafe { std::fs::File::from_raw_fd(self.fd) };
        let res = match file.read(&mut buf) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        };
        std::mem::forget(file);
        res
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_drain_does_not_error() {
        let w = Waker::new().unwrap();
        w.wake().unwrap();
        w.drain().unwrap();
        w.drain().unwrap();
    }
}
