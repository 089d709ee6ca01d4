//! The connection state machine: owner of the socket `Channel` and both
//! buffers, producer of the public send/shutdown/force-close/read-control
//! surface. Grounded on annety's `TCPConnection`.
//!
//! Lives inside `EventLoop::objects` for the same reason `Acceptor` and
//! `Connector` do. Application callbacks that run on the owning loop
//! (connect/message/write-complete/high-water-mark/close) get `&mut
//! TcpConnection` directly — they are already on the right thread, so
//! there is nothing to dispatch. [`TcpConnectionHandle`] is the
//! thread-safe capability for callers anywhere else; like
//! `EventLoopHandle`, it has no direct access to the connection's state
//! so every one of its operations queues onto the owning loop rather
//! than attempting an "inline if local" fast path.

use std::time::Instant;

use log::{error, trace, warn};

use crate::buffer::ByteBuffer;
use crate::channel::Channel;
use crate::context::Context;
use crate::endpoint::Endpoint;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::fd::SelectableFd;
use crate::socket_ops::{self, RawFdReader};
use crate::timer::TimerId;
use crate::token::Token;

pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

pub type ConnectCb = Box<dyn FnMut(&mut EventLoop, &mut TcpConnection) + Send>;
/// Receives the connection with its input buffer already filled by the
/// read that triggered this callback. The callback decides how much to
/// consume — a raw echo handler drains it all, a framing codec peeks a
/// length prefix and leaves a partial frame for the next read — exactly
/// the `recv(conn, input_buffer, ts)` contract codecs are built around.
pub type MessageCb = Box<dyn FnMut(&mut EventLoop, &mut TcpConnection, Instant) + Send>;
pub type WriteCompleteCb = Box<dyn FnMut(&mut EventLoop, &mut TcpConnection) + Send>;
pub type HighWaterMarkCb = Box<dyn FnMut(&mut EventLoop, &mut TcpConnection, usize) + Send>;
pub type CloseCb = Box<dyn FnMut(&mut EventLoop, &mut TcpConnection) + Send>;

pub struct TcpConnection {
    name: String,
    token: Token,
    fd: SelectableFd,
    local_addr: Endpoint,
    peer_addr: Endpoint,
    state: State,
    reading: bool,
    input: ByteBuffer,
    output: ByteBuffer,
    high_water_mark: usize,
    high_water_mark_reached: bool,
    context: Context,
    connect_cb: Option<ConnectCb>,
    message_cb: Option<MessageCb>,
    write_complete_cb: Option<WriteCompleteCb>,
    high_water_mark_cb: Option<HighWaterMarkCb>,
    close_cb: Option<CloseCb>,
    destroyed: bool,
}

impl TcpConnection {
    pub fn new(
        event_loop: &mut EventLoop,
        name: String,
        fd: SelectableFd,
        local_addr: Endpoint,
        peer_addr: Endpoint,
    ) -> Self {
        let token = event_loop.allocate_token();
        TcpConnection {
            name,
            token,
            fd,
            local_addr,
            peer_addr,
            state: State::Connecting,
            reading: false,
            input: ByteBuffer::new(),
            output: ByteBuffer::new(),
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            high_water_mark_reached: false,
            context: Context::new(),
            connect_cb: None,
            message_cb: None,
            write_complete_cb: None,
            high_water_mark_cb: None,
            close_cb: None,
            destroyed: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> Endpoint {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Endpoint {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state == State::Connected
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn input_buffer(&self) -> &ByteBuffer {
        &self.input
    }

    pub fn input_buffer_mut(&mut self) -> &mut ByteBuffer {
        &mut self.input
    }

    pub fn output_buffer(&self) -> &ByteBuffer {
        &self.output
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn set_high_water_mark(&mut self, bytes: usize) {
        self.high_water_mark = bytes;
    }

    pub fn set_tcp_nodelay(&self, on: bool) -> std::io::Result<()> {
        socket_ops::set_tcp_nodelay(std::os::unix::io::AsRawFd::as_raw_fd(&self.fd), on)
    }

    pub fn set_connect_callback(&mut self, cb: ConnectCb) {
        self.connect_cb = Some(cb);
    }

    pub fn set_message_callback(&mut self, cb: MessageCb) {
        self.message_cb = Some(cb);
    }

    pub fn set_write_complete_callback(&mut self, cb: WriteCompleteCb) {
        self.write_complete_cb = Some(cb);
    }

    pub fn set_high_water_mark_callback(&mut self, cb: HighWaterMarkCb) {
        self.high_water_mark_cb = Some(cb);
    }

    pub fn set_close_callback(&mut self, cb: CloseCb) {
        self.close_cb = Some(cb);
    }

    /// Capability usable from any thread: name/addresses are immutable
    /// copies, `loop_handle` is the only channel back to the owning loop.
    pub fn handle(&self, loop_handle: EventLoopHandle) -> TcpConnectionHandle {
        TcpConnectionHandle {
            token: self.token,
            loop_handle,
            name: self.name.clone(),
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
        }
    }

    /// Installs the socket channel and transitions Connecting -> Connected.
    /// Must run on the owning loop; called once by `TcpServer`/`TcpClient`
    /// right after construction.
    pub fn connect_established(&mut self, event_loop: &mut EventLoop) {
        assert_eq!(self.state, State::Connecting, "connect_established called twice");
        self.state = State::Connected;
        self.reading = true;

        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&self.fd);
        let mut channel = Channel::new(fd, self.token);
        channel.enable_reading();
        channel.set_read_callback(Box::new(move |event_loop, token, recv_time| {
            TcpConnection::with_self(event_loop, token, |this, event_loop| {
                this.handle_read(event_loop, recv_time);
            });
        }));
        channel.set_write_callback(Box::new(move |event_loop, token| {
            TcpConnection::with_self(event_loop, token, |this, event_loop| {
                this.handle_write(event_loop);
            });
        }));
        channel.set_close_callback(Box::new(move |event_loop, token| {
            TcpConnection::with_self(event_loop, token, |this, event_loop| {
                this.handle_close(event_loop);
            });
        }));
        channel.set_error_callback(Box::new(move |event_loop, token| {
            TcpConnection::with_self(event_loop, token, |this, event_loop| {
                this.handle_error(event_loop);
            });
        }));
        event_loop.update_channel(channel);

        let mut cb = self.connect_cb.take();
        if let Some(c) = cb.as_mut() {
            c(event_loop, self);
        }
        self.connect_cb = cb;
    }

    /// Remove-downcast-reinsert helper shared by every channel callback
    /// that needs to reach a `TcpConnection` parked in
    /// `EventLoop::objects` (the same shape `Connector::with_self` uses).
    fn with_self(event_loop: &mut EventLoop, token: Token, f: impl FnOnce(&mut TcpConnection, &mut EventLoop)) {
        let Some(boxed) = event_loop.remove_object(token) else { return };
        match boxed.downcast::<TcpConnection>() {
            Ok(mut conn) => {
                f(&mut conn, event_loop);
                // `connect_destroyed` marks the connection as done; leaving
                // it out of `objects` here is what actually drops it (and
                // closes its fd) instead of keeping it alive forever.
                if !conn.destroyed {
                    event_loop.insert_object(token, *conn);
                }
            }
            Err(boxed) => event_loop.insert_object_boxed(token, boxed),
        }
    }

    fn handle_read(&mut self, event_loop: &mut EventLoop, recv_time: Instant) {
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&self.fd);
        let mut reader = RawFdReader(fd);
        match self.input.read_fd(&mut reader) {
            Ok(0) => self.handle_close(event_loop),
            Ok(_) => {
                let mut cb = self.message_cb.take();
                if let Some(c) = cb.as_mut() {
                    c(event_loop, self, recv_time);
                }
                self.message_cb = cb;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("connection {}: read error: {e}", self.name);
                self.handle_error(event_loop);
            }
        }
    }

    fn handle_write(&mut self, event_loop: &mut EventLoop) {
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&self.fd);
        if self.output.readable_bytes() == 0 {
            return;
        }
        match socket_ops::raw_write(fd, self.output.to_slice()) {
            Ok(n) => {
                self.output.has_read(n);
                if self.output.readable_bytes() == 0 {
                    self.disable_writing(event_loop);
                    let mut cb = self.write_complete_cb.take();
                    if let Some(c) = cb.as_mut() {
                        c(event_loop, self);
                    }
                    self.write_complete_cb = cb;
                    if self.state == State::Disconnecting {
                        self.shutdown_in_loop(event_loop);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("connection {}: write error: {e}", self.name);
            }
        }
    }

    fn handle_close(&mut self, event_loop: &mut EventLoop) {
        if self.state != State::Connected && self.state != State::Disconnecting {
            return;
        }
        self.state = State::Disconnected;
        if let Some(mut channel) = event_loop_take_channel(event_loop, self.token) {
            channel.disable_all();
            event_loop.update_channel(channel);
        }

        let mut connect_cb = self.connect_cb.take();
        if let Some(c) = connect_cb.as_mut() {
            c(event_loop, self);
        }
        self.connect_cb = connect_cb;

        let mut close_cb = self.close_cb.take();
        if let Some(c) = close_cb.as_mut() {
            c(event_loop, self);
        }
        self.close_cb = close_cb;
    }

    fn handle_error(&mut self, event_loop: &mut EventLoop) {
        let err = socket_ops::socket_error(std::os::unix::io::AsRawFd::as_raw_fd(&self.fd)).unwrap_or(0);
        trace!("connection {}: error event, SO_ERROR={err}", self.name);
        self.handle_close(event_loop);
    }

    /// Tears down the channel and marks the connection as done. Idempotent;
    /// called once the close path has fully run and the owning container
    /// (`TcpServer`/`TcpClient`) no longer references this connection.
    /// `TcpConnection::with_self` checks `destroyed` afterwards and drops
    /// the connection instead of putting it back in `EventLoop::objects`.
    pub fn connect_destroyed(&mut self, event_loop: &mut EventLoop) {
        if self.state == State::Connected {
            self.state = State::Disconnected;
        }
        if event_loop.has_channel(self.token) {
            event_loop.remove_channel(self.token);
        }
        self.destroyed = true;
    }

    fn enable_writing(&mut self, event_loop: &mut EventLoop) {
        if let Some(mut channel) = event_loop_take_channel(event_loop, self.token) {
            channel.enable_writing();
            event_loop.update_channel(channel);
        }
    }

    fn disable_writing(&mut self, event_loop: &mut EventLoop) {
        if let Some(mut channel) = event_loop_take_channel(event_loop, self.token) {
            channel.disable_writing();
            event_loop.update_channel(channel);
        }
    }

    pub fn send(&mut self, event_loop: &mut EventLoop, data: &[u8]) {
        if self.state == State::Connected {
            self.send_in_loop_slice(event_loop, data);
        }
    }

    fn send_in_loop_slice(&mut self, event_loop: &mut EventLoop, data: &[u8]) {
        if self.state == State::Disconnected {
            warn!("connection {}: send on a disconnected connection, dropping", self.name);
            return;
        }

        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&self.fd);
        let mut nwritten = 0usize;
        let mut fault = false;
        let channel_is_writing = event_loop.has_channel(self.token)
            && channel_writing(event_loop, self.token);

        if !channel_is_writing && self.output.readable_bytes() == 0 {
            match socket_ops::raw_write(fd, data) {
                Ok(n) => {
                    nwritten = n;
                    if n == data.len() {
                        let mut cb = self.write_complete_cb.take();
                        if let Some(c) = cb.as_mut() {
                            c(event_loop, self);
                        }
                        self.write_complete_cb = cb;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e)
                    if e.raw_os_error() == Some(libc::EPIPE)
                        || e.raw_os_error() == Some(libc::ECONNRESET) =>
                {
                    fault = true;
                }
                Err(e) => {
                    warn!("connection {}: direct write failed: {e}", self.name);
                    fault = true;
                }
            }
        }

        if !fault && nwritten < data.len() {
            let old_len = self.output.readable_bytes();
            let remaining = data.len() - nwritten;
            if old_len + remaining >= self.high_water_mark
                && old_len < self.high_water_mark
                && !self.high_water_mark_reached
            {
                self.high_water_mark_reached = true;
                let new_len = old_len + remaining;
                let mut cb = self.high_water_mark_cb.take();
                if let Some(c) = cb.as_mut() {
                    c(event_loop, self, new_len);
                }
                self.high_water_mark_cb = cb;
            }
            self.output.append(&data[nwritten..]);
            self.enable_writing(event_loop);
        } else if self.output.readable_bytes() == 0 {
            self.high_water_mark_reached = false;
        }
    }

    pub fn shutdown(&mut self, event_loop: &mut EventLoop) {
        self.shutdown_in_loop(event_loop);
    }

    fn shutdown_in_loop(&mut self, event_loop: &mut EventLoop) {
        if self.state != State::Connected {
            return;
        }
        self.state = State::Disconnecting;
        if self.output.readable_bytes() == 0 {
            let fd = std::os::unix::io::AsRawFd::as_raw_fd(&self.fd);
            let _ = socket_ops::shutdown_write(fd);
        }
    }

    pub fn force_close(&mut self, event_loop: &mut EventLoop) {
        if self.state == State::Connected || self.state == State::Disconnecting {
            self.state = State::Disconnecting;
            self.handle_close(event_loop);
        }
    }

    /// Schedules `force_close` after `delay`. The timer closure only
    /// captures the token, not the connection itself, so a connection
    /// that has already died naturally and been dropped from
    /// `EventLoop::objects` is simply a no-op when the timer fires
    /// rather than being kept alive or resurrected.
    pub fn force_close_with_delay(&mut self, event_loop: &mut EventLoop, delay: std::time::Duration) -> TimerId {
        let token = self.token;
        event_loop.run_after(
            delay,
            Box::new(move |event_loop| {
                TcpConnection::with_self(event_loop, token, |this, event_loop| {
                    this.force_close(event_loop);
                });
            }),
        )
    }

    pub fn start_read(&mut self, event_loop: &mut EventLoop) {
        if !self.reading {
            self.reading = true;
            if let Some(mut channel) = event_loop_take_channel(event_loop, self.token) {
                channel.enable_reading();
                event_loop.update_channel(channel);
            }
        }
    }

    pub fn stop_read(&mut self, event_loop: &mut EventLoop) {
        if self.reading {
            self.reading = false;
            if let Some(mut channel) = event_loop_take_channel(event_loop, self.token) {
                channel.disable_reading();
                event_loop.update_channel(channel);
            }
        }
    }
}

/// `EventLoop` has no public "peek at a channel" accessor beyond
/// `has_channel`, because the normal owner of a `Channel` mid-lifetime
/// is whichever object installed it; these two free functions are the
/// narrow exception `TcpConnection` needs to flip its own interest bits
/// without `EventLoop` growing a general channel-mutation API.
fn event_loop_take_channel(event_loop: &mut EventLoop, token: Token) -> Option<Channel> {
    event_loop.take_channel(token)
}

fn channel_writing(event_loop: &mut EventLoop, token: Token) -> bool {
    event_loop.channel_is_writing(token)
}

/// Thread-safe capability for a `TcpConnection` living on another
/// thread's loop. Every operation queues onto the owning loop; see the
/// module doc comment for why there is no same-thread fast path here.
#[derive(Clone)]
pub struct TcpConnectionHandle {
    token: Token,
    loop_handle: EventLoopHandle,
    name: String,
    local_addr: Endpoint,
    peer_addr: Endpoint,
}

impl TcpConnectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> Endpoint {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Endpoint {
        self.peer_addr
    }

    pub fn send(&self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        let token = self.token;
        self.loop_handle.queue_in_own_loop(Box::new(move |event_loop| {
            TcpConnection::with_self(event_loop, token, |this, event_loop| {
                this.send_in_loop_slice(event_loop, &data);
            });
        }));
    }

    pub fn shutdown(&self) {
        let token = self.token;
        self.loop_handle.queue_in_own_loop(Box::new(move |event_loop| {
            TcpConnection::with_self(event_loop, token, |this, event_loop| {
                this.shutdown_in_loop(event_loop);
            });
        }));
    }

    pub fn force_close(&self) {
        let token = self.token;
        self.loop_handle.queue_in_own_loop(Box::new(move |event_loop| {
            TcpConnection::with_self(event_loop, token, |this, event_loop| {
                this.force_close(event_loop);
            });
        }));
    }

    pub fn start_read(&self) {
        let token = self.token;
        self.loop_handle.queue_in_own_loop(Box::new(move |event_loop| {
            TcpConnection::with_self(event_loop, token, |this, event_loop| {
                this.start_read(event_loop);
            });
        }));
    }

    pub fn stop_read(&self) {
        let token = self.token;
        self.loop_handle.queue_in_own_loop(Box::new(move |event_loop| {
            TcpConnection::with_self(event_loop, token, |this, event_loop| {
                this.stop_read(event_loop);
            });
        }));
    }
}
