//! Demultiplexer abstraction: same `Poller` trait surface, two concrete
//! shapes — a poll-style scan of a dense fd array (`poll.rs`) and an
//! epoll-style edge-scan (`epoll.rs`). Grounded on `mio`'s
//! `sys/unix/selector/{poll,epoll}.rs`: both expose `register`/
//! `reregister`/`deregister`/`select`, single-threaded, called only from
//! the owning loop.

pub mod epoll;
pub mod poll;

use std::io;
use std::time::{Duration, Instant};

use crate::channel::{Interest, Ready};
use crate::token::Token;

/// One readiness report for one registered fd.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub token: Token,
    pub ready: Ready,
}

/// The demultiplexer contract. Implementations are legal to call only
/// from their owning `EventLoop`'s thread.
pub trait Poller: Send {
    /// Blocks for at most `timeout` (or indefinitely if `None`), returning
    /// the ready events and a monotonic wall timestamp taken on return.
    fn poll(&mut self, timeout: Option<Duration>) -> io::Result<(Vec<PollEvent>, Instant)>;

    fn register(&mut self, fd: i32, token: Token, interest: Interest) -> io::Result<()>;

    fn reregister(&mut self, fd: i32, token: Token, interest: Interest) -> io::Result<()>;

    fn deregister(&mut self, fd: i32, token: Token) -> io::Result<()>;

    fn has_fd(&self, fd: i32) -> bool;
}

/// Which demultiplexer backend to construct. Chosen at configuration time
/// (never switched at runtime) per spec.md §9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerKind {
    Poll,
    Epoll,
}

pub fn new_poller(kind: PollerKind) -> io::Result<Box<dyn Poller>> {
    match kind {
        PollerKind::Poll => Ok(Box::new(poll::PollPoller::new()?)),
        PollerKind::Epoll => Ok(Box::new(epoll::EpollPoller::new()?)),
    }
}
