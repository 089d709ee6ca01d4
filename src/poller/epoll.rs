//! Epoll-style poller. Grounded on `mio/src/sys/unix/selector/epoll.rs`:
//! `epoll_create1`/`EPOLL_CTL_{ADD,MOD,DEL}`, a growable `epoll_event`
//! buffer doubling on a full batch.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::channel::{Interest, Ready};
use crate::sys::syscall;
use crate::token::Token;

use super::{PollEvent, Poller};

const INITIAL_EVENTS_CAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Added,
    Deleted,
}

pub struct EpollPoller {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
    state: HashMap<RawFd, State>,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollPoller {
            epfd,
            events: vec![unsafe { std::mem::zeroed() }; INITIAL_EVENTS_CAP],
            state: HashMap::new(),
        })
    }

    fn interests_to_epoll(interest: Interest) -> u32 {
        let mut e = 0u32;
        if interest.readable {
            e |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
        }
        if interest.writable {
            e |= libc::EPOLLOUT as u32;
        }
        e
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<(Vec<PollEvent>, Instant)> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };

        let n = syscall!(epoll_wait(
            self.epfd,
            self.events.as_mut_ptr(),
            self.events.len() as i32,
            timeout_ms,
        ))?;
        let now = Instant::now();

        let mut out = Vec::with_capacity(n as usize);
        for ev in &self.events[..n as usize] {
            let token = Token(ev.u64 as usize);
            let e = ev.events as i32;
            let ready = Ready {
                readable: e & (libc::EPOLLIN | libc::EPOLLPRI) != 0,
                writable: e & libc::EPOLLOUT != 0,
                error: e & libc::EPOLLERR != 0,
                hup: e & libc::EPOLLHUP != 0 || e & libc::EPOLLRDHUP != 0,
                priority: e & libc::EPOLLPRI != 0,
                invalid: false,
            };
            out.push(PollEvent { token, ready });
        }

        if n as usize == self.events.len() {
            let new_len = self.events.len() * 2;
            self.events.resize(new_len, unsafe { std::mem::zeroed() });
        }

        Ok((out, now))
    }

    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: Self::interests_to_epoll(interest),
            u64: token.0 as u64,
        };
        match self.state.get(&fd) {
            Some(State::Added) => {
                syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut event))?;
            }
            _ => {
                syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut event))?;
            }
        }
        self.state.insert(fd, State::Added);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: Self::interests_to_epoll(interest),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut event))?;
        self.state.insert(fd, State::Added);
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd, _token: Token) -> io::Result<()> {
        let rc = syscall!(epoll_ctl(
            self.epfd,
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ));
        match rc {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                // Already gone (fd closed under us); non-fatal per spec §4.4.
            }
            Err(e) => return Err(e),
        }
        self.state.insert(fd, State::Deleted);
        Ok(())
    }

    fn has_fd(&self, fd: RawFd) -> bool {
        matches!(self.state.get(&fd), Some(State::Added))
    }
}
