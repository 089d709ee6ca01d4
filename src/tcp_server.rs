//! Listener lifecycle: owns the `Acceptor`, hands each accepted socket
//! to a worker loop from its `EventLoopPool`, and tracks every live
//! connection so it can force them all closed on shutdown. Grounded on
//! annety's `TCPServer`.
//!
//! A server's user callbacks are shared across every connection it
//! accepts, so unlike `TcpConnection`'s own per-connection `FnMut`
//! slots, they are stored here as `Arc<dyn Fn + Send + Sync>` and
//! wrapped in a fresh `FnMut` shim for each new connection. The
//! connection map itself is an `Arc<Mutex<..>>` shared with the
//! acceptor's callback, which runs on the accepting loop, while
//! connections are established on whichever worker loop they were
//! handed to — the mutex is what makes that safe, not thread affinity.

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info};

use crate::acceptor::Acceptor;
use crate::endpoint::Endpoint;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::event_loop_pool::EventLoopPool;
use crate::poller::PollerKind;
use crate::socket_ops;
use crate::tcp_connection::{TcpConnection, TcpConnectionHandle};
use crate::token::Token;

type ConnectFn = dyn Fn(&mut EventLoop, &mut TcpConnection) + Send + Sync;
type MessageFn = dyn Fn(&mut EventLoop, &mut TcpConnection, Instant) + Send + Sync;
type WriteCompleteFn = dyn Fn(&mut EventLoop, &mut TcpConnection) + Send + Sync;
type HighWaterMarkFn = dyn Fn(&mut EventLoop, &mut TcpConnection, usize) + Send + Sync;
type CloseFn = dyn Fn(&mut EventLoop, &mut TcpConnection) + Send + Sync;

#[derive(Default)]
struct Callbacks {
    connect: Option<Arc<ConnectFn>>,
    message: Option<Arc<MessageFn>>,
    write_complete: Option<Arc<WriteCompleteFn>>,
    high_water_mark: Option<Arc<HighWaterMarkFn>>,
    close: Option<Arc<CloseFn>>,
}

/// A listening TCP server. `new` binds and registers the acceptor on
/// `accept_loop`; `start` is the idempotent switch that actually begins
/// accepting (and, if a thread pool was configured, spins it up first).
pub struct TcpServer {
    name: String,
    addr: Endpoint,
    accept_loop: EventLoopHandle,
    acceptor_token: Token,
    pool: EventLoopPool,
    poller_kind: PollerKind,
    started: Arc<AtomicBool>,
    callbacks: Callbacks,
    connections: Arc<Mutex<HashMap<String, TcpConnectionHandle>>>,
    next_conn_id: Arc<AtomicU64>,
}

impl TcpServer {
    pub fn new(
        event_loop: &mut EventLoop,
        name: String,
        addr: Endpoint,
        poller_kind: PollerKind,
    ) -> std::io::Result<Self> {
        let acceptor = Acceptor::new(event_loop, &addr, true)?;
        let acceptor_token = acceptor.token();
        event_loop.insert_object(acceptor_token, acceptor);

        Ok(TcpServer {
            name,
            addr,
            accept_loop: event_loop.handle(),
            acceptor_token,
            pool: EventLoopPool::new(event_loop.handle()),
            poller_kind,
            started: Arc::new(AtomicBool::new(false)),
            callbacks: Callbacks::default(),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn set_connect_callback(&mut self, cb: impl Fn(&mut EventLoop, &mut TcpConnection) + Send + Sync + 'static) {
        self.callbacks.connect = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &mut self,
        cb: impl Fn(&mut EventLoop, &mut TcpConnection, Instant) + Send + Sync + 'static,
    ) {
        self.callbacks.message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &mut self,
        cb: impl Fn(&mut EventLoop, &mut TcpConnection) + Send + Sync + 'static,
    ) {
        self.callbacks.write_complete = Some(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &mut self,
        cb: impl Fn(&mut EventLoop, &mut TcpConnection, usize) + Send + Sync + 'static,
    ) {
        self.callbacks.high_water_mark = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl Fn(&mut EventLoop, &mut TcpConnection) + Send + Sync + 'static) {
        self.callbacks.close = Some(Arc::new(cb));
    }

    /// Spawns `num_threads` worker loops to round-robin accepted
    /// connections across. Must be called before `start`.
    pub fn set_thread_num(&mut self, num_threads: usize) -> crate::error::Result<()> {
        self.pool.start(num_threads, self.poller_kind)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Idempotent via an atomic test-and-set: the first caller installs
    /// the acceptor's new-connection callback and begins listening;
    /// later callers are no-ops.
    pub fn start(&mut self, event_loop: &mut EventLoop) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("tcp server {} listening on {}", self.name, self.addr);

        let Some(boxed) = event_loop.remove_object(self.acceptor_token) else { return };
        let mut acceptor = match boxed.downcast::<Acceptor>() {
            Ok(a) => a,
            Err(b) => {
                event_loop.insert_object_boxed(self.acceptor_token, b);
                return;
            }
        };

        let server_name = self.name.clone();
        let connections = self.connections.clone();
        let next_conn_id = self.next_conn_id.clone();
        let accept_loop = self.accept_loop.clone();
        let connect_cb = self.callbacks.connect.clone();
        let message_cb = self.callbacks.message.clone();
        let write_complete_cb = self.callbacks.write_complete.clone();
        let high_water_mark_cb = self.callbacks.high_water_mark.clone();
        let close_cb = self.callbacks.close.clone();
        let worker_handles = self.pool.all_loops();
        let mut next_pick = 0usize;

        acceptor.set_new_connection_callback(Box::new(move |_accept_loop, conn_fd, peer_addr| {
            let workers = if worker_handles.is_empty() { std::slice::from_ref(&accept_loop) } else { &worker_handles[..] };
            let worker = workers[next_pick % workers.len()].clone();
            next_pick = next_pick.wrapping_add(1);

            let conn_id = next_conn_id.fetch_add(1, Ordering::SeqCst);
            let name = format!("{server_name}#{peer_addr}#{conn_id}");
            let fd = conn_fd.as_raw_fd();
            let local = socket_ops::local_addr(fd)
                .map(Endpoint::from_socket_addr)
                .unwrap_or_else(|_| Endpoint::from_socket_addr(peer_addr));
            let peer = Endpoint::from_socket_addr(peer_addr);

            let connections = connections.clone();
            let connect_cb = connect_cb.clone();
            let message_cb = message_cb.clone();
            let write_complete_cb = write_complete_cb.clone();
            let high_water_mark_cb = high_water_mark_cb.clone();
            let close_cb = close_cb.clone();
            let loop_handle_for_conn = worker.clone();

            worker.queue_in_own_loop(Box::new(move |worker_loop| {
                let mut conn = TcpConnection::new(worker_loop, name.clone(), conn_fd, local, peer);

                if let Some(cb) = connect_cb {
                    conn.set_connect_callback(Box::new(move |el, c| cb(el, c)));
                }
                if let Some(cb) = message_cb {
                    conn.set_message_callback(Box::new(move |el, c, ts| cb(el, c, ts)));
                }
                if let Some(cb) = write_complete_cb {
                    conn.set_write_complete_callback(Box::new(move |el, c| cb(el, c)));
                }
                if let Some(cb) = high_water_mark_cb {
                    conn.set_high_water_mark_callback(Box::new(move |el, c, n| cb(el, c, n)));
                }
                let conn_name = name.clone();
                let connections_for_close = connections.clone();
                conn.set_close_callback(Box::new(move |el, c| {
                    if let Some(cb) = &close_cb {
                        cb(el, c);
                    }
                    connections_for_close.lock().unwrap().remove(&conn_name);
                    c.connect_destroyed(el);
                }));

                let token = conn.token();
                let handle = conn.handle(loop_handle_for_conn);
                conn.connect_established(worker_loop);
                worker_loop.insert_object(token, conn);
                connections.lock().unwrap().insert(name, handle);
            }));
        }));

        if let Err(e) = acceptor.listen(event_loop) {
            log::error!("tcp server {}: failed to listen on {}: {e}", self.name, self.addr);
        }
        event_loop.insert_object(self.acceptor_token, *acceptor);
    }

    /// Forces every live connection through `force_close` on its own
    /// worker loop, then drops the server's map of them. Called for a
    /// graceful shutdown (spec scenario S6).
    pub fn shutdown_all(&mut self) {
        let mut connections = self.connections.lock().unwrap();
        for (_, handle) in connections.drain() {
            handle.force_close();
        }
        debug!("tcp server {} shut down all connections", self.name);
    }
}
