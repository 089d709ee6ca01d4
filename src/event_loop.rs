//! The reactor core: one `EventLoop` per thread, polling its registered
//! channels and firing due timers until told to quit. Grounded on
//! annety's `EventLoop` (poll -> handle active channels -> run pending
//! functors -> fire expired timers) and on `mio`'s ownership model, where
//! the `Poll`/`Registry` pair is confined to one thread while a cheap
//! cloneable handle (here `EventLoopHandle`, there `Waker` + `Registry`)
//! is what crosses threads.
//!
//! `Channel`s live in `EventLoop::channels`, but invoking a channel's own
//! callback needs `&mut EventLoop` at the same time its callback is
//! borrowed out of that very map — two overlapping mutable borrows of
//! the same field. `dispatch_channel` resolves this by taking only the
//! four callback closures out of the channel for the duration of the
//! call, leaving the channel's fd/token/interest bookkeeping in the map
//! the whole time, so a callback that calls back into the loop (e.g.
//! `stop_read` on its own connection) still finds its channel there.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::channel::Channel;
use crate::poller::{new_poller, Poller, PollerKind};
use crate::timer::{TimerCallback, TimerId, TimerPool};
use crate::token::{Token, WAKEUP_TOKEN};
use crate::wakeup::Waker;

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

pub type Task = Box<dyn FnOnce(&mut EventLoop) + Send>;

struct Shared {
    waker: Waker,
    tasks: Mutex<Vec<Task>>,
    quit: AtomicBool,
    thread_id: Mutex<Option<ThreadId>>,
}

/// A cheap, `Send + Sync` capability for a loop running on another
/// thread: wake it, ask it to quit, or hand it a closure to run. Holds
/// no channel/timer/object state — only what is safe to touch from
/// anywhere.
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<Shared>,
}

impl EventLoopHandle {
    pub fn is_in_own_loop(&self) -> bool {
        *self.shared.thread_id.lock().unwrap() == Some(thread::current().id())
    }

    pub fn check_in_own_loop(&self) {
        assert!(
            self.is_in_own_loop(),
            "operation requires the owning event loop's thread"
        );
    }

    /// Hands `task` to the owning loop. Because this handle has no
    /// direct access to the loop's state, there is no safe way to run
    /// `task` inline even when the caller happens to already be on the
    /// loop's thread — every path goes through the task queue and a
    /// wake-up, whether or not the caller is local. This collapses what
    /// would otherwise be two distinct operations (blocking same-thread
    /// call vs. deferred cross-thread call) into one.
    pub fn queue_in_own_loop(&self, task: Task) {
        self.shared.tasks.lock().unwrap().push(task);
        let _ = self.shared.waker.wake();
    }

    /// Alias for [`queue_in_own_loop`](Self::queue_in_own_loop); kept as
    /// a distinct name because call sites read more clearly when they
    /// say what they mean ("run this on the loop" vs. "queue this for
    /// later"), even though the two behave identically here.
    pub fn run_in_own_loop(&self, task: Task) {
        self.queue_in_own_loop(task);
    }

    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        let _ = self.shared.waker.wake();
    }

    pub fn wake(&self) {
        let _ = self.shared.waker.wake();
    }
}

pub struct EventLoop {
    shared: Arc<Shared>,
    poller: Box<dyn Poller>,
    channels: HashMap<Token, Channel>,
    objects: HashMap<Token, Box<dyn Any + Send>>,
    timers: TimerPool,
    next_token: usize,
    poll_timeout: Duration,
}

impl EventLoop {
    pub fn new(kind: PollerKind) -> io::Result<Self> {
        let mut poller = new_poller(kind)?;
        let waker = Waker::new()?;
        poller.register(
            waker.raw_fd(),
            WAKEUP_TOKEN,
            crate::channel::Interest::READABLE,
        )?;

        Ok(EventLoop {
            shared: Arc::new(Shared {
                waker,
                tasks: Mutex::new(Vec::new()),
                quit: AtomicBool::new(false),
                thread_id: Mutex::new(None),
            }),
            poller,
            channels: HashMap::new(),
            objects: HashMap::new(),
            timers: TimerPool::new(),
            next_token: 0,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle { shared: self.shared.clone() }
    }

    pub fn set_poll_timeout(&mut self, timeout: Duration) {
        self.poll_timeout = timeout;
    }

    pub fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn is_in_own_loop(&self) -> bool {
        match *self.shared.thread_id.lock().unwrap() {
            Some(id) => id == thread::current().id(),
            None => true, // not yet running: treat the constructing thread as "own"
        }
    }

    pub fn check_in_own_loop(&self) {
        assert!(
            self.is_in_own_loop(),
            "operation requires the owning event loop's thread"
        );
    }

    // -- channel lifecycle -------------------------------------------------

    pub fn update_channel(&mut self, mut channel: Channel) {
        self.check_in_own_loop();
        let token = channel.token();
        let interest = channel.interest();
        if channel.added_to_loop() {
            let _ = self.poller.reregister(channel.fd(), token, interest);
        } else {
            let _ = self.poller.register(channel.fd(), token, interest);
            channel.set_added_to_loop(true);
        }
        self.channels.insert(token, channel);
    }

    /// Removes a channel. Safe to call from within that channel's own
    /// callback: dispatch only detaches the channel's callbacks while it
    /// runs (see `dispatch_channel`), leaving the channel itself — and
    /// therefore this lookup — in place.
    pub fn remove_channel(&mut self, token: Token) {
        self.check_in_own_loop();
        if let Some(channel) = self.channels.remove(&token) {
            let _ = self.poller.deregister(channel.fd(), token);
        }
    }

    pub fn has_channel(&self, token: Token) -> bool {
        self.channels.contains_key(&token)
    }

    pub fn channel_is_writing(&self, token: Token) -> bool {
        self.channels.get(&token).map(Channel::is_writing).unwrap_or(false)
    }

    /// Detaches a channel for in-place mutation (flip an interest bit,
    /// say) by its owner, who is expected to hand it back via
    /// `update_channel`. Returns `None` only if the channel was never
    /// registered or has already been removed.
    pub fn take_channel(&mut self, token: Token) -> Option<Channel> {
        self.channels.remove(&token)
    }

    /// Dispatches one ready mask to its channel's callbacks. The
    /// channel's callbacks are taken out for the duration of the call
    /// and put back afterward (unless the channel was removed during
    /// dispatch), so the channel's fd/token/interest state — and
    /// therefore `has_channel`/`take_channel`/`update_channel` — stays
    /// reachable even from a callback nested inside this dispatch (e.g.
    /// a message handler that calls `stop_read` on its own connection).
    fn dispatch_channel(&mut self, token: Token, ready: crate::channel::Ready, recv_time: Instant) {
        let Some(channel) = self.channels.get_mut(&token) else { return };
        let (mut read_cb, mut write_cb, mut close_cb, mut error_cb) = channel.take_callbacks();

        if ready.hup && !ready.readable {
            if let Some(cb) = close_cb.as_mut() {
                cb(self, token);
            }
        }
        if ready.error || ready.invalid {
            if let Some(cb) = error_cb.as_mut() {
                cb(self, token);
            }
        }
        if ready.readable || ready.priority || ready.hup {
            if let Some(cb) = read_cb.as_mut() {
                cb(self, token, recv_time);
            }
        }
        if ready.writable {
            if let Some(cb) = write_cb.as_mut() {
                cb(self, token);
            }
        }

        if let Some(channel) = self.channels.get_mut(&token) {
            channel.put_callbacks(read_cb, write_cb, close_cb, error_cb);
        }
    }

    // -- type-erased per-connection state -----------------------------------

    pub fn insert_object<T: Any + Send>(&mut self, token: Token, value: T) {
        self.objects.insert(token, Box::new(value));
    }

    pub fn object<T: Any + Send>(&self, token: Token) -> Option<&T> {
        self.objects.get(&token).and_then(|b| b.downcast_ref())
    }

    pub fn object_mut<T: Any + Send>(&mut self, token: Token) -> Option<&mut T> {
        self.objects.get_mut(&token).and_then(|b| b.downcast_mut())
    }

    pub fn remove_object(&mut self, token: Token) -> Option<Box<dyn Any + Send>> {
        self.objects.remove(&token)
    }

    pub fn insert_object_boxed(&mut self, token: Token, value: Box<dyn Any + Send>) {
        self.objects.insert(token, value);
    }

    // -- timers --------------------------------------------------------------

    pub fn run_at(&mut self, when: Instant, callback: TimerCallback) -> TimerId {
        self.timers.add(when, None, callback)
    }

    pub fn run_after(&mut self, delay: Duration, callback: TimerCallback) -> TimerId {
        self.timers.add(Instant::now() + delay, None, callback)
    }

    pub fn run_every(&mut self, interval: Duration, callback: TimerCallback) -> TimerId {
        self.timers.add(Instant::now() + interval, Some(interval), callback)
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    // -- lifecycle -------------------------------------------------------------

    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        let _ = self.shared.waker.wake();
    }

    /// Same effect as [`quit`](Self::quit); kept as a distinct name for
    /// callers that want to express "stop unconditionally, now" rather
    /// than "finish this iteration and stop".
    pub fn terminate(&self) {
        self.quit();
    }

    pub fn run(&mut self) -> io::Result<()> {
        *self.shared.thread_id.lock().unwrap() = Some(thread::current().id());
        debug!("event loop starting on {:?}", thread::current().id());
        while !self.shared.quit.load(Ordering::SeqCst) {
            self.run_once()?;
        }
        debug!("event loop quitting");
        Ok(())
    }

    /// Runs exactly one poll/dispatch/timer/task cycle. Exposed for tests
    /// and for callers embedding the loop in their own driving code.
    pub fn run_once(&mut self) -> io::Result<()> {
        let timeout = self
            .timers
            .next_expiration()
            .map(|at| at.saturating_duration_since(Instant::now()))
            .map(|d| d.min(self.poll_timeout))
            .unwrap_or(self.poll_timeout);

        let (events, recv_time) = self.poller.poll(Some(timeout))?;
        trace!("poll woke with {} event(s)", events.len());

        for event in events {
            if event.token == WAKEUP_TOKEN {
                let _ = self.shared.waker.drain();
                continue;
            }
            self.dispatch_channel(event.token, event.ready, recv_time);
        }

        let now = Instant::now();
        let mut timers = std::mem::take(&mut self.timers);
        timers.expire(now, self);
        self.timers = timers;

        let tasks = {
            let mut guard = self.shared.tasks.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            task(self);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_once_fires_a_due_timer() {
        let mut event_loop = EventLoop::new(PollerKind::Epoll).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        event_loop.run_after(Duration::from_millis(1), Box::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));
        std::thread::sleep(Duration::from_millis(5));
        event_loop.run_once().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_queue_wakes_blocked_loop() {
        let mut event_loop = EventLoop::new(PollerKind::Epoll).unwrap();
        event_loop.set_poll_timeout(Duration::from_secs(30));
        let handle = event_loop.handle();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        handle.queue_in_own_loop(Box::new(move |_| {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        event_loop.run_once().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
