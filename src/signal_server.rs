//! Delivers POSIX signals into an `EventLoop` as ordinary channel
//! events. Grounded on annety's `SignalServer` (signalfd-backed on
//! Linux) and spec.md §4.14.
//!
//! Construction is only legal on the main thread — a signalfd masks
//! the signal process-wide via `sigprocmask`, which would race with
//! any other thread handling the same signal synchronously.

use std::collections::HashMap;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

use log::{trace, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::fd::{FdKind, SelectableFd};
use crate::sys::syscall;
use crate::token::Token;

pub type SignalCb = Box<dyn FnMut(&mut EventLoop, i32) + Send>;

/// Lives inside `EventLoop::objects`, like every other type whose
/// channel callback only receives `&mut EventLoop` + `Token`.
pub struct SignalServer {
    fd: SelectableFd,
    token: Token,
    mask: libc::sigset_t,
    callbacks: HashMap<i32, SignalCb>,
}

impl SignalServer {
    /// Creates an empty signal server with no signals yet masked. Must
    /// be called before spawning any other thread that should keep its
    /// default disposition for the signals this server will own.
    pub fn new(event_loop: &mut EventLoop) -> std::io::Result<Self> {
        let mask = unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            set
        };
        let fd = create_signalfd(&mask)?;
        let token = event_loop.allocate_token();
        Ok(SignalServer { fd, token, mask, callbacks: HashMap::new() })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Registers `cb` for `signo`, masking the signal (so it no longer
    /// interrupts the process synchronously) and extending the
    /// signalfd's watch set. Replaces any previously registered
    /// callback for the same signal.
    pub fn add_signal(&mut self, signo: i32, cb: SignalCb) -> std::io::Result<()> {
        unsafe {
            libc::sigaddset(&mut self.mask, signo);
        }
        self.apply_mask()?;
        self.callbacks.insert(signo, cb);
        Ok(())
    }

    /// Unregisters `signo`, restoring its default disposition.
    pub fn delete_signal(&mut self, signo: i32) -> std::io::Result<()> {
        self.callbacks.remove(&signo);
        unsafe {
            libc::sigdelset(&mut self.mask, signo);
        }
        self.apply_mask()
    }

    /// Drops every registered signal and restores default dispositions
    /// for all of them.
    pub fn reset_signals(&mut self) -> std::io::Result<()> {
        self.callbacks.clear();
        unsafe {
            libc::sigemptyset(&mut self.mask);
        }
        self.apply_mask()
    }

    fn apply_mask(&mut self) -> std::io::Result<()> {
        syscall!(sigprocmask(libc::SIG_SETMASK, &self.mask, std::ptr::null_mut()))?;
        let fd = unsafe {
            libc::signalfd(self.fd.as_raw_fd(), &self.mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        debug_assert_eq!(fd, self.fd.as_raw_fd(), "signalfd(2) must update the existing fd in place");
        Ok(())
    }

    /// Registers the channel with the loop. Must be called once, after
    /// `self` has already been moved into `event_loop.objects` under
    /// `self.token()`, matching `Acceptor::listen`'s precondition.
    pub fn listen(&self, event_loop: &mut EventLoop) {
        let mut channel = Channel::new(self.fd.as_raw_fd(), self.token);
        channel.enable_reading();
        channel.set_read_callback(Box::new(|event_loop, token, _recv_time| {
            let Some(boxed) = event_loop.remove_object(token) else { return };
            match boxed.downcast::<SignalServer>() {
                Ok(mut server) => {
                    server.handle_read(event_loop);
                    event_loop.insert_object(token, *server);
                }
                Err(boxed) => event_loop.insert_object_boxed(token, boxed),
            }
        }));
        event_loop.update_channel(channel);
    }

    fn handle_read(&mut self, event_loop: &mut EventLoop) {
        loop {
            let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    &mut info as *mut _ as *mut libc::c_void,
                    mem::size_of::<libc::signalfd_siginfo>(),
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != std::io::ErrorKind::WouldBlock {
                    warn!("signal server: read failed: {err}");
                }
                break;
            }
            if n as usize != mem::size_of::<libc::signalfd_siginfo>() {
                break;
            }
            let signo = info.ssi_signo as i32;
            trace!("signal server: received signal {signo}");
            if let Some(cb) = self.callbacks.get_mut(&signo) {
                cb(event_loop, signo);
            }
        }
    }
}

fn create_signalfd(mask: &libc::sigset_t) -> std::io::Result<SelectableFd> {
    let fd = unsafe { libc::signalfd(-1, mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { SelectableFd::from_raw(fd as RawFd, FdKind::Signal) })
}
