//! `retia`: a single-machine, multi-reactor TCP networking runtime.
//!
//! One `EventLoop` owns one thread, each polling its own set of
//! registered channels (`Channel`) via a pluggable demultiplexer
//! (`Poller`, poll or epoll). `TcpServer` and `TcpClient` sit on top of
//! `Acceptor`/`Connector` and distribute accepted or reconnected
//! connections across an `EventLoopPool` of worker loops. Cross-thread
//! control goes through `EventLoopHandle`/`TcpConnectionHandle`, never
//! through shared mutable state directly.
//!
//! Grounded throughout on annety (a muduo-style C++ reactor library) and
//! generalized using the demultiplexer and ownership patterns of `mio`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_debug_implementations)]

#[cfg(not(unix))]
compile_error!("retia only supports unix targets (epoll/poll, signalfd)");

pub mod features {
    //! Cargo feature flags.
    //!
    //! - `os-poll` (default): enables the `Poller`/epoll/poll backed
    //!   event demultiplexer and everything built on it (`EventLoop`,
    //!   `TcpServer`, `TcpClient`, codecs). Disabling it leaves only the
    //!   data-only types (`ByteBuffer`, `Endpoint`) usable.
    //! - `signal` (implies `os-poll`): enables `SignalServer`.
    //! - `log` (default): routes internal diagnostics through the `log`
    //!   crate's facade. Without it, the crate stays silent.
}

pub mod buffer;
pub mod endpoint;
pub mod error;

#[cfg(feature = "os-poll")]
mod sys;

#[cfg(feature = "os-poll")]
pub mod token;

#[cfg(feature = "os-poll")]
pub mod fd;

#[cfg(feature = "os-poll")]
pub mod channel;

#[cfg(feature = "os-poll")]
pub mod poller;

#[cfg(feature = "os-poll")]
pub mod timer;

#[cfg(feature = "os-poll")]
pub mod wakeup;

#[cfg(feature = "os-poll")]
pub mod context;

#[cfg(feature = "os-poll")]
pub mod event_loop;

#[cfg(feature = "os-poll")]
pub mod event_loop_pool;

#[cfg(feature = "os-poll")]
pub mod socket_ops;

#[cfg(feature = "os-poll")]
pub mod acceptor;

#[cfg(feature = "os-poll")]
pub mod connector;

#[cfg(feature = "os-poll")]
pub mod tcp_connection;

#[cfg(feature = "os-poll")]
pub mod tcp_server;

#[cfg(feature = "os-poll")]
pub mod tcp_client;

#[cfg(feature = "os-poll")]
pub mod codec;

#[cfg(feature = "signal")]
#[cfg_attr(docsrs, doc(cfg(feature = "signal")))]
pub mod signal_server;

pub use buffer::ByteBuffer;
pub use endpoint::{Endpoint, Family};
pub use error::{Error, FramingError, Result};

#[cfg(feature = "os-poll")]
pub use acceptor::Acceptor;
#[cfg(feature = "os-poll")]
pub use channel::{Channel, Interest, Ready};
#[cfg(feature = "os-poll")]
pub use codec::{Codec, Decoded, Encoded};
#[cfg(feature = "os-poll")]
pub use connector::Connector;
#[cfg(feature = "os-poll")]
pub use context::Context;
#[cfg(feature = "os-poll")]
pub use event_loop::{EventLoop, EventLoopHandle};
#[cfg(feature = "os-poll")]
pub use event_loop_pool::{EventLoopPool, EventLoopThread};
#[cfg(feature = "os-poll")]
pub use poller::PollerKind;
#[cfg(feature = "os-poll")]
pub use tcp_client::TcpClient;
#[cfg(feature = "os-poll")]
pub use tcp_connection::{TcpConnection, TcpConnectionHandle};
#[cfg(feature = "os-poll")]
pub use tcp_server::TcpServer;
#[cfg(feature = "os-poll")]
pub use timer::TimerId;
#[cfg(feature = "os-poll")]
pub use token::Token;

#[cfg(feature = "signal")]
#[cfg_attr(docsrs, doc(cfg(feature = "signal")))]
pub use signal_server::SignalServer;
