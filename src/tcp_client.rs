//! Outbound connection with automatic retry, built on `Connector`.
//! Grounded on annety's `TCPClient`.
//!
//! Lives inside `EventLoop::objects` under its own token, for the same
//! reason `Connector` and `TcpConnection` do: the connector's
//! new-connection callback and the established connection's close
//! callback both only receive `&mut EventLoop`, and need to reach back
//! into `TcpClient` state (the stored connection handle, the
//! retry/connect intent flags).
//!
//! Like `TcpServer`, the user callbacks are `Arc<dyn Fn + Send + Sync>`
//! rather than the `FnMut` boxes `TcpConnection` itself uses, since a
//! client that reconnects after a drop needs the same callback again
//! for the new connection and a moved `FnMut` closure cannot be reused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::connector::Connector;
use crate::endpoint::Endpoint;
use crate::event_loop::EventLoop;
use crate::fd::SelectableFd;
use crate::socket_ops;
use crate::tcp_connection::{TcpConnection, TcpConnectionHandle};
use crate::token::Token;

type ConnectFn = dyn Fn(&mut EventLoop, &mut TcpConnection) + Send + Sync;
type MessageFn = dyn Fn(&mut EventLoop, &mut TcpConnection, Instant) + Send + Sync;
type WriteCompleteFn = dyn Fn(&mut EventLoop, &mut TcpConnection) + Send + Sync;
type HighWaterMarkFn = dyn Fn(&mut EventLoop, &mut TcpConnection, usize) + Send + Sync;
type CloseFn = dyn Fn(&mut EventLoop, &mut TcpConnection) + Send + Sync;
type ErrorConnectFn = dyn Fn(&mut EventLoop) + Send + Sync;

#[derive(Default)]
struct Callbacks {
    connect: Option<Arc<ConnectFn>>,
    message: Option<Arc<MessageFn>>,
    write_complete: Option<Arc<WriteCompleteFn>>,
    high_water_mark: Option<Arc<HighWaterMarkFn>>,
    close: Option<Arc<CloseFn>>,
    error_connect: Option<Arc<ErrorConnectFn>>,
}

pub struct TcpClient {
    token: Token,
    name: String,
    server_addr: Endpoint,
    connector_token: Token,
    callback_installed: bool,
    retry_intent: AtomicBool,
    connect_intent: bool,
    callbacks: Callbacks,
    connection: Option<TcpConnectionHandle>,
}

impl TcpClient {
    /// Allocates a token for itself and one for its `Connector`, both
    /// registered in `event_loop`'s object table. The caller must
    /// finish the job with `event_loop.insert_object(client.token(),
    /// client)` before calling `connect`.
    pub fn new(event_loop: &mut EventLoop, name: String, server_addr: Endpoint) -> Self {
        let token = event_loop.allocate_token();
        let connector_token = event_loop.allocate_token();
        event_loop.insert_object(connector_token, Connector::new(server_addr));

        TcpClient {
            token,
            name,
            server_addr,
            connector_token,
            callback_installed: false,
            retry_intent: AtomicBool::new(true),
            connect_intent: false,
            callbacks: Callbacks::default(),
            connection: None,
        }
    }

    pub fn token(&self) -> Token {
        self.token
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

    /// Fires when a connect attempt is refused (`ECONNREFUSED`) instead
    /// of the usual retry.
    pub fn set_error_connect_callback(&mut self, cb: impl Fn(&mut EventLoop) + Send + Sync + 'static) {
        self.callbacks.error_connect = Some(Arc::new(cb));
    }

    /// Whether a dropped connection is retried automatically. Defaults
    /// to `true`.
    pub fn enable_retry(&mut self, on: bool) {
        self.retry_intent.store(on, Ordering::SeqCst);
    }

    pub fn connection(&self) -> Option<&TcpConnectionHandle> {
        self.connection.as_ref()
    }

    /// Starts connecting (and retrying on failure or drop) to the
    /// server. Idempotent while already connecting or connected.
    pub fn connect(&mut self, event_loop: &mut EventLoop) {
        self.connect_intent = true;
        let connector_token = self.connector_token;
        let client_token = self.token;

        with_connector(event_loop, connector_token, |connector, event_loop| {
            connector.start(event_loop, connector_token);
        });

        if !self.callback_installed {
            self.callback_installed = true;
            let error_connect_cb = self.callbacks.error_connect.clone();
            with_connector(event_loop, connector_token, |connector, _| {
                connector.set_new_connection_callback(Box::new(move |event_loop, fd| {
                    TcpClient::with_self(event_loop, client_token, |this, event_loop| {
                        this.handle_new_connection(event_loop, fd);
                    });
                }));
                connector.set_error_connect_callback(Box::new(move |event_loop| {
                    if let Some(cb) = &error_connect_cb {
                        cb(event_loop);
                    }
                }));
            });
        }
    }

    /// Stops retrying and shuts the current connection down, if any.
    /// The connector itself stays armed so a later `connect` resumes
    /// cleanly.
    pub fn disconnect(&mut self, event_loop: &mut EventLoop) {
        self.connect_intent = false;
        let connector_token = self.connector_token;
        with_connector(event_loop, connector_token, |connector, event_loop| {
            connector.stop(event_loop);
        });
        if let Some(handle) = &self.connection {
            handle.shutdown();
        }
    }

    /// Like `disconnect`, but also cancels any pending retry timer
    /// immediately rather than letting an in-flight attempt land.
    pub fn stop(&mut self, event_loop: &mut EventLoop) {
        self.disconnect(event_loop);
    }

    fn handle_new_connection(&mut self, event_loop: &mut EventLoop, fd: SelectableFd) {
        let raw_fd = std::os::unix::io::AsRawFd::as_raw_fd(&fd);
        let local = match socket_ops::local_addr(raw_fd) {
            Ok(a) => Endpoint::from_socket_addr(a),
            Err(_) => self.server_addr,
        };
        let peer = socket_ops::peer_addr(raw_fd).map(Endpoint::from_socket_addr).unwrap_or(self.server_addr);
        let name = format!("{}#{}", self.name, peer);

        let mut conn = TcpConnection::new(event_loop, name, fd, local, peer);
        if let Some(cb) = self.callbacks.connect.clone() {
            conn.set_connect_callback(Box::new(move |el, c| cb(el, c)));
        }
        if let Some(cb) = self.callbacks.message.clone() {
            conn.set_message_callback(Box::new(move |el, c, ts| cb(el, c, ts)));
        }
        if let Some(cb) = self.callbacks.write_complete.clone() {
            conn.set_write_complete_callback(Box::new(move |el, c| cb(el, c)));
        }
        if let Some(cb) = self.callbacks.high_water_mark.clone() {
            conn.set_high_water_mark_callback(Box::new(move |el, c, n| cb(el, c, n)));
        }

        let client_token = self.token;
        let user_close = self.callbacks.close.clone();
        conn.set_close_callback(Box::new(move |el, c| {
            if let Some(cb) = &user_close {
                cb(el, c);
            }
            TcpClient::with_self(el, client_token, |this, event_loop| {
                this.remove_connection(event_loop);
            });
            c.connect_destroyed(el);
        }));

        let token = conn.token();
        let handle = conn.handle(event_loop.handle());
        conn.connect_established(event_loop);
        event_loop.insert_object(token, conn);
        self.connection = Some(handle);
    }

    fn remove_connection(&mut self, event_loop: &mut EventLoop) {
        self.connection = None;
        if self.retry_intent.load(Ordering::SeqCst) && self.connect_intent {
            let connector_token = self.connector_token;
            with_connector(event_loop, connector_token, |connector, event_loop| {
                connector.restart(event_loop, connector_token);
            });
        }
    }

    /// Remove-downcast-reinsert helper shared by every callback that
    /// needs to reach a `TcpClient` parked in `EventLoop::objects`.
    fn with_self(event_loop: &mut EventLoop, token: Token, f: impl FnOnce(&mut TcpClient, &mut EventLoop)) {
        let Some(boxed) = event_loop.remove_object(token) else { return };
        match boxed.downcast::<TcpClient>() {
            Ok(mut client) => {
                f(&mut client, event_loop);
                event_loop.insert_object(token, *client);
            }
            Err(boxed) => event_loop.insert_object_boxed(token, boxed),
        }
    }
}

fn with_connector(event_loop: &mut EventLoop, token: Token, f: impl FnOnce(&mut Connector, &mut EventLoop)) {
    let Some(boxed) = event_loop.remove_object(token) else { return };
    match boxed.downcast::<Connector>() {
        Ok(mut connector) => {
            f(&mut connector, event_loop);
            event_loop.insert_object(token, *connector);
        }
        Err(boxed) => event_loop.insert_object_boxed(token, boxed),
    }
}
