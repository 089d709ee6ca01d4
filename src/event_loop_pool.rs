//! Convenience wrappers for running event loops on dedicated threads, and
//! a fixed-size pool of them for distributing accepted connections.
//! Grounded on annety's `EventLoopThread`/`EventLoopThreadPool` (own a
//! `JoinHandle`, hand out loops round-robin) and on `mio`'s multi-reactor
//! examples that each pin one `Poll` to one worker thread.

use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::poller::PollerKind;

/// Runs a single `EventLoop` on its own thread, started lazily on first
/// [`handle`](Self::handle) / [`start`](Self::start) and joined on drop.
pub struct EventLoopThread {
    kind: PollerKind,
    join: Option<JoinHandle<()>>,
    handle: Option<EventLoopHandle>,
}

impl EventLoopThread {
    pub fn new(kind: PollerKind) -> Self {
        EventLoopThread { kind, join: None, handle: None }
    }

    /// Spawns the worker thread and blocks until its loop is constructed,
    /// returning a handle usable from any thread.
    pub fn start(&mut self) -> io::Result<EventLoopHandle> {
        if let Some(h) = &self.handle {
            return Ok(h.clone());
        }

        let (tx, rx) = mpsc::channel();
        let kind = self.kind;
        let join = thread::Builder::new()
            .name("event-loop".into())
            .spawn(move || {
                let mut event_loop = match EventLoop::new(kind) {
                    Ok(l) => l,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let _ = tx.send(Ok(event_loop.handle()));
                if let Err(e) = event_loop.run() {
                    debug!("event loop thread exiting on error: {e}");
                }
            })?;

        let handle = rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "event loop thread died before starting"))??;
        self.handle = Some(handle.clone());
        self.join = Some(join);
        Ok(handle)
    }

    pub fn handle(&self) -> Option<EventLoopHandle> {
        self.handle.clone()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.quit();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// A fixed pool of `EventLoopThread`s that a `TcpServer` hands accepted
/// connections to round-robin. An empty pool (`num_threads == 0`) means
/// "run everything on the accepting loop", matching annety's
/// `EventLoopThreadPool` default.
pub struct EventLoopPool {
    base_handle: EventLoopHandle,
    threads: Vec<EventLoopThread>,
    handles: Vec<EventLoopHandle>,
    next: usize,
    started: bool,
}

impl EventLoopPool {
    pub fn new(base_handle: EventLoopHandle) -> Self {
        EventLoopPool {
            base_handle,
            threads: Vec::new(),
            handles: Vec::new(),
            next: 0,
            started: false,
        }
    }

    /// Spawns `num_threads` worker loops. Must be called at most once,
    /// before any connection is dispatched.
    pub fn start(&mut self, num_threads: usize, kind: PollerKind) -> crate::error::Result<()> {
        if self.started {
            return Err(crate::error::Error::PoolAlreadyStarted);
        }
        self.started = true;
        for i in 0..num_threads {
            let mut thread = EventLoopThread::new(kind);
            let handle = thread.start()?;
            debug!("event loop pool worker {i} started");
            self.handles.push(handle);
            self.threads.push(thread);
        }
        Ok(())
    }

    /// Returns the next loop to hand a new connection to, round-robin
    /// across workers, falling back to the accepting loop if the pool
    /// has no workers of its own.
    pub fn next_loop(&mut self) -> EventLoopHandle {
        if self.handles.is_empty() {
            return self.base_handle.clone();
        }
        let handle = self.handles[self.next].clone();
        self.next = (self.next + 1) % self.handles.len();
        handle
    }

    pub fn all_loops(&self) -> Vec<EventLoopHandle> {
        if self.handles.is_empty() {
            vec![self.base_handle.clone()]
        } else {
            self.handles.clone()
        }
    }
}
