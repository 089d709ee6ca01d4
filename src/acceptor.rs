//! Listening-socket management for `TcpServer`. Grounded on annety's
//! `Acceptor` (idle fd reserved against `EMFILE`, edge-triggered accept
//! loop draining `accept4` until it returns `EAGAIN`).
//!
//! Lives inside `EventLoop::objects`, the same type-erased slot table
//! `TcpConnection` uses, since its read callback only gets `&mut
//! EventLoop` and must reach back into `Acceptor` state through a
//! remove-downcast-reinsert (the same shape `Channel` dispatch uses for
//! `EventLoop::channels` itself).

use std::os::unix::io::{AsRawFd, RawFd};

use log::{error, warn};

use crate::channel::Channel;
use crate::endpoint::Endpoint;
use crate::event_loop::EventLoop;
use crate::fd::SelectableFd;
use crate::socket_ops;
use crate::token::Token;

pub type NewConnectionCb = Box<dyn FnMut(&mut EventLoop, SelectableFd, std::net::SocketAddr) + Send>;

pub struct Acceptor {
    fd: SelectableFd,
    token: Token,
    new_connection_cb: Option<NewConnectionCb>,
    /// Held open and unused so the process always has one spare fd to
    /// free by closing it when `accept4` reports `EMFILE`, long enough
    /// to accept-and-drop the pending connection instead of spinning on
    /// a listening socket the loop cannot stop seeing as readable.
    idle_fd: RawFd,
}

impl Acceptor {
    pub fn new(event_loop: &mut EventLoop, addr: &Endpoint, reuse_port: bool) -> std::io::Result<Self> {
        let socket = socket_ops::new_nonblocking_socket(&addr.socket_addr())?;
        socket_ops::set_reuse_addr(socket.as_raw_fd(), true)?;
        if reuse_port {
            socket_ops::set_reuse_port(socket.as_raw_fd(), true)?;
        }
        socket_ops::bind(socket.as_raw_fd(), addr)?;

        let token = event_loop.allocate_token();
        let idle_fd = open_idle_fd()?;

        Ok(Acceptor { fd: socket, token, new_connection_cb: None, idle_fd })
    }

    pub fn set_new_connection_callback(&mut self, cb: NewConnectionCb) {
        self.new_connection_cb = Some(cb);
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Starts listening and registers the acceptor's channel. `self`
    /// must already have been moved into `event_loop`'s object table
    /// under `self.token()` before calling this, so the read callback
    /// installed here can reach it.
    pub fn listen(&self, event_loop: &mut EventLoop) -> std::io::Result<()> {
        socket_ops::listen(self.fd.as_raw_fd(), 4096)?;

        let mut channel = Channel::new(self.fd.as_raw_fd(), self.token);
        channel.enable_reading();
        channel.set_read_callback(Box::new(|event_loop, token, _recv_time| {
            let Some(boxed) = event_loop.remove_object(token) else { return };
            match boxed.downcast::<Acceptor>() {
                Ok(mut acceptor) => {
                    acceptor.handle_read(event_loop);
                    event_loop.insert_object(token, *acceptor);
                }
                Err(boxed) => {
                    // Not ours; put it back untouched.
                    event_loop.insert_object_boxed(token, boxed);
                }
            }
        }));
        event_loop.update_channel(channel);
        Ok(())
    }

    /// Drains pending connections, invoking the new-connection callback
    /// for each, until `accept4` reports `EAGAIN`.
    fn handle_read(&mut self, event_loop: &mut EventLoop) {
        loop {
            match socket_ops::accept(self.fd.as_raw_fd()) {
                Ok((conn_fd, peer_addr)) => {
                    if let Some(cb) = self.new_connection_cb.as_mut() {
                        cb(event_loop, conn_fd, peer_addr);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    warn!("acceptor out of file descriptors, dropping a pending connection");
                    unsafe {
                        libc::close(self.idle_fd);
                    }
                    let _ = socket_ops::accept(self.fd.as_raw_fd());
                    match open_idle_fd() {
                        Ok(fd) => self.idle_fd = fd,
                        Err(e) => error!("failed to reopen acceptor idle fd: {e}"),
                    }
                    break;
                }
                Err(e) => {
                    error!("accept4 failed: {e}");
                    break;
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.idle_fd >= 0 {
            unsafe {
                libc::close(self.idle_fd);
            }
        }
    }
}

fn open_idle_fd() -> std::io::Result<RawFd> {
    let fd = unsafe {
        libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY | libc::O_CLOEXEC)
    };
    if fd < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}
