//! Poll-style poller: a dense `pollfd` array plus an `fd -> array index`
//! map. Grounded on `mio/src/sys/unix/selector/poll.rs`: swap-with-last on
//! remove to keep the array dense, grow on a fully-saturated return.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::channel::{Interest, Ready};
use crate::sys::syscall;
use crate::token::Token;

use super::{PollEvent, Poller};

struct Slot {
    fd: RawFd,
    token: Token,
}

pub struct PollPoller {
    fds: Vec<libc::pollfd>,
    slots: Vec<Slot>,
    index: HashMap<RawFd, usize>,
}

impl PollPoller {
    pub fn new() -> io::Result<Self> {
        Ok(PollPoller {
            fds: Vec::new(),
            slots: Vec::new(),
            index: HashMap::new(),
        })
    }

    fn interest_to_events(interest: Interest) -> i16 {
        let mut e = 0;
        if interest.readable {
            e |= libc::POLLIN | libc::POLLPRI;
        }
        if interest.writable {
            e |= libc::POLLOUT;
        }
        e as i16
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<(Vec<PollEvent>, Instant)> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };

        let n = if self.fds.is_empty() {
            // `poll(2)` with an empty array just sleeps for `timeout`; do
            // that via a zero-length call rather than special-casing.
            syscall!(poll(std::ptr::null_mut(), 0, timeout_ms))?
        } else {
            syscall!(poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms))?
        };
        let now = Instant::now();

        let mut out = Vec::with_capacity(n.max(0) as usize);
        if n > 0 {
            for (i, pfd) in self.fds.iter().enumerate() {
                if pfd.fd < 0 || pfd.revents == 0 {
                    continue;
                }
                let revents = pfd.revents as i32;
                let ready = Ready {
                    readable: revents & (libc::POLLIN | libc::POLLPRI) != 0,
                    writable: revents & libc::POLLOUT != 0,
                    error: revents & libc::POLLERR != 0,
                    hup: revents & libc::POLLHUP != 0,
                    priority: revents & libc::POLLPRI != 0,
                    invalid: revents & libc::POLLNVAL != 0,
                };
                out.push(PollEvent { token: self.slots[i].token, ready });
            }
        }

        Ok((out, now))
    }

    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if let Some(&i) = self.index.get(&fd) {
            self.fds[i].events = Self::interest_to_events(interest);
            self.slots[i].token = token;
            return Ok(());
        }
        self.fds.push(libc::pollfd {
            fd,
            events: Self::interest_to_events(interest),
            revents: 0,
        });
        self.slots.push(Slot { fd, token });
        self.index.insert(fd, self.fds.len() - 1);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.register(fd, token, interest)
    }

    fn deregister(&mut self, fd: RawFd, _token: Token) -> io::Result<()> {
        if let Some(i) = self.index.remove(&fd) {
            let last = self.fds.len() - 1;
            self.fds.swap(i, last);
            self.slots.swap(i, last);
            self.fds.pop();
            self.slots.pop();
            if i < self.fds.len() {
                self.index.insert(self.fds[i].fd, i);
            }
        }
        Ok(())
    }

    fn has_fd(&self, fd: RawFd) -> bool {
        self.index.contains_key(&fd)
    }
}
