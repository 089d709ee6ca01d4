//! Outbound-connection state machine for `TcpClient`. Grounded on
//! annety's `Connector` (states `Disconnected -> Connecting ->
//! Connected`, exponential retry backoff, self-connect detection via
//! comparing local/peer addresses once writable).

use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::channel::Channel;
use crate::endpoint::Endpoint;
use crate::event_loop::EventLoop;
use crate::fd::SelectableFd;
use crate::socket_ops;
use crate::timer::TimerId;
use crate::token::Token;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

pub type NewConnectionCb = Box<dyn FnMut(&mut EventLoop, SelectableFd) + Send>;
/// Fires on `ECONNREFUSED`, in place of the usual retry.
pub type ErrorConnectCb = Box<dyn FnMut(&mut EventLoop) + Send>;

/// Lives inside `EventLoop::objects` for the same reason `Acceptor`
/// does: its channel callbacks only receive `&mut EventLoop`.
pub struct Connector {
    server_addr: Endpoint,
    state: State,
    connect: bool,
    retry_delay: Duration,
    token: Option<Token>,
    fd: Option<RawFd>,
    retry_timer: Option<TimerId>,
    new_connection_cb: Option<NewConnectionCb>,
    error_connect_cb: Option<ErrorConnectCb>,
}

impl Connector {
    pub fn new(server_addr: Endpoint) -> Self {
        Connector {
            server_addr,
            state: State::Disconnected,
            connect: false,
            retry_delay: INITIAL_RETRY_DELAY,
            token: None,
            fd: None,
            retry_timer: None,
            new_connection_cb: None,
            error_connect_cb: None,
        }
    }

    pub fn set_new_connection_callback(&mut self, cb: NewConnectionCb) {
        self.new_connection_cb = Some(cb);
    }

    pub fn set_error_connect_callback(&mut self, cb: ErrorConnectCb) {
        self.error_connect_cb = Some(cb);
    }

    /// Starts (or resumes) connecting. Idempotent while already
    /// connecting or connected.
    pub fn start(&mut self, event_loop: &mut EventLoop, self_token: Token) {
        self.connect = true;
        self.token = Some(self_token);
        if self.state != State::Disconnected {
            return;
        }
        self.connect_in_loop(event_loop);
    }

    /// Stops retrying. An in-flight connect attempt is allowed to finish
    /// and is then immediately torn down.
    pub fn stop(&mut self, event_loop: &mut EventLoop) {
        self.connect = false;
        if let Some(id) = self.retry_timer.take() {
            event_loop.cancel_timer(id);
        }
    }

    /// Resets backoff and restarts from `Disconnected`. Used by
    /// `TcpClient` after a connection it owns is torn down and it wants
    /// to reconnect with fresh retry timing.
    pub fn restart(&mut self, event_loop: &mut EventLoop, self_token: Token) {
        self.state = State::Disconnected;
        self.retry_delay = INITIAL_RETRY_DELAY;
        self.connect = true;
        self.start(event_loop, self_token);
    }

    fn connect_in_loop(&mut self, event_loop: &mut EventLoop) {
        self.state = State::Connecting;
        let socket = match socket_ops::new_nonblocking_socket(&self.server_addr.socket_addr()) {
            Ok(s) => s,
            Err(e) => {
                warn!("connector: failed to create socket: {e}");
                self.retry(event_loop);
                return;
            }
        };
        let fd = socket.into_raw();
        self.fd = Some(fd);

        match socket_ops::connect(fd, &self.server_addr) {
            Ok(true) | Ok(false) => self.connecting(event_loop, fd),
            Err(e) => {
                let errno = e.raw_os_error();
                self.fd = None;
                unsafe {
                    libc::close(fd);
                }
                if is_retryable_connect_errno(errno) {
                    warn!("connector: connect to {} failed: {e}, retrying", self.server_addr);
                    self.retry(event_loop);
                } else {
                    warn!("connector: connect to {} failed: {e}, not retrying", self.server_addr);
                    self.state = State::Disconnected;
                }
            }
        }
    }

    fn connecting(&mut self, event_loop: &mut EventLoop, fd: RawFd) {
        let token = self.token.expect("connector started without a token");
        let mut channel = Channel::new(fd, token);
        channel.enable_reading();
        channel.enable_writing();
        channel.set_read_callback(Box::new(|event_loop, token, _recv_time| {
            Connector::with_self(event_loop, token, |this, event_loop| {
                this.handle_read(event_loop);
            });
        }));
        channel.set_write_callback(Box::new(|event_loop, token| {
            Connector::with_self(event_loop, token, |this, event_loop| {
                this.handle_write(event_loop);
            });
        }));
        channel.set_error_callback(Box::new(|event_loop, token| {
            Connector::with_self(event_loop, token, |this, event_loop| {
                this.handle_error(event_loop);
            });
        }));
        event_loop.update_channel(channel);
    }

    fn handle_write(&mut self, event_loop: &mut EventLoop) {
        if self.state != State::Connecting {
            return;
        }
        let fd = self.fd.expect("connecting with no fd");
        let token = self.token.expect("connecting with no token");

        match socket_ops::socket_error(fd) {
            Ok(0) => {
                let local = socket_ops::local_addr(fd).ok();
                let peer = socket_ops::peer_addr(fd).ok();
                if local.is_some() && local == peer {
                    warn!("connector: detected self-connect to {}, retrying", self.server_addr);
                    event_loop.remove_channel(token);
                    unsafe {
                        libc::close(fd);
                    }
                    self.fd = None;
                    self.retry(event_loop);
                    return;
                }
                self.state = State::Connected;
                event_loop.remove_channel(token);
                self.fd = None;
                let socket = unsafe { SelectableFd::from_raw(fd, crate::fd::FdKind::Socket) };
                if let Some(cb) = self.new_connection_cb.as_mut() {
                    cb(event_loop, socket);
                } else {
                    drop(socket);
                }
            }
            Ok(_) | Err(_) => {
                event_loop.remove_channel(token);
                unsafe {
                    libc::close(fd);
                }
                self.fd = None;
                self.retry(event_loop);
            }
        }
    }

    /// Readable while still `Connecting` is the other documented way a
    /// connect attempt turns out to have failed (the writable event is
    /// the expected success path). Reads `SO_ERROR` the same way
    /// `handle_write` does, but `ECONNREFUSED` fires the error-connect
    /// callback instead of scheduling a retry.
    fn handle_read(&mut self, event_loop: &mut EventLoop) {
        if self.state != State::Connecting {
            return;
        }
        let fd = self.fd.expect("connecting with no fd");
        let err = socket_ops::socket_error(fd).unwrap_or(0);
        trace!("connector: readable while connecting, SO_ERROR={err}");
        self.abandon_connecting_socket(event_loop);
        self.fail_connecting(event_loop, err);
    }

    fn handle_error(&mut self, event_loop: &mut EventLoop) {
        if self.state != State::Connecting {
            return;
        }
        let fd = self.fd.expect("connecting with no fd");
        let err = socket_ops::socket_error(fd).unwrap_or(0);
        trace!("connector: error event while connecting, SO_ERROR={err}");
        self.abandon_connecting_socket(event_loop);
        self.fail_connecting(event_loop, err);
    }

    fn abandon_connecting_socket(&mut self, event_loop: &mut EventLoop) {
        let token = self.token.expect("connecting with no token");
        event_loop.remove_channel(token);
        if let Some(fd) = self.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }

    /// `ECONNREFUSED` gets its own callback and no retry; anything else
    /// retries like a failed write-side check would.
    fn fail_connecting(&mut self, event_loop: &mut EventLoop, errno: i32) {
        if errno == libc::ECONNREFUSED {
            self.state = State::Disconnected;
            if let Some(cb) = self.error_connect_cb.as_mut() {
                cb(event_loop);
            }
        } else {
            self.retry(event_loop);
        }
    }

    fn retry(&mut self, event_loop: &mut EventLoop) {
        self.state = State::Disconnected;
        if !self.connect {
            return;
        }
        let token = self.token.expect("retry without a token");
        debug!("connector: retrying {} in {:?}", self.server_addr, self.retry_delay);
        let delay = self.retry_delay;
        self.retry_timer = Some(event_loop.run_after(
            delay,
            Box::new(move |event_loop| {
                Connector::with_self(event_loop, token, |this, event_loop| {
                    this.retry_timer = None;
                    if this.connect {
                        this.connect_in_loop(event_loop);
                    }
                });
            }),
        ));
        self.retry_delay = (self.retry_delay * 2).min(MAX_RETRY_DELAY);
    }

    /// Remove-downcast-reinsert helper shared by every callback that
    /// needs to reach a `Connector` parked in `EventLoop::objects`.
    fn with_self(event_loop: &mut EventLoop, token: Token, f: impl FnOnce(&mut Connector, &mut EventLoop)) {
        let Some(boxed) = event_loop.remove_object(token) else { return };
        match boxed.downcast::<Connector>() {
            Ok(mut connector) => {
                f(&mut connector, event_loop);
                event_loop.insert_object(token, *connector);
            }
            Err(boxed) => event_loop.insert_object_boxed(token, boxed),
        }
    }
}

/// Buckets the errno an initial non-blocking `connect()` can fail with.
/// `EAGAIN`/`EADDRINUSE`/`EADDRNOTAVAIL`/`ECONNREFUSED`/`ENETUNREACH` are
/// transient enough to retry; everything else (`EACCES`, `EPERM`,
/// `EAFNOSUPPORT`, `EALREADY`, `EBADF`, `EFAULT`, `ENOTSOCK`, and any
/// errno not named here) means the socket/address combination itself is
/// broken, so retrying would just fail the same way forever.
fn is_retryable_connect_errno(errno: Option<i32>) -> bool {
    matches!(
        errno,
        Some(libc::EAGAIN)
            | Some(libc::EADDRINUSE)
            | Some(libc::EADDRNOTAVAIL)
            | Some(libc::ECONNREFUSED)
            | Some(libc::ENETUNREACH)
    )
}
