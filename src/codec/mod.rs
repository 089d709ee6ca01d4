//! Framing codecs that sit on top of a `TcpConnection`'s raw byte
//! stream. Grounded on spec.md §4.15's common contract: a codec owns
//! one typed message callback, decodes incrementally off the
//! connection's input buffer, and encodes outgoing payloads onto its
//! output buffer.

pub mod delimiter;
pub mod length_prefixed;
pub mod protobuf;

use std::time::Instant;

use log::warn;

use crate::buffer::ByteBuffer;
use crate::event_loop::EventLoop;
use crate::tcp_connection::{MessageCb, TcpConnection};

/// Result of `Codec::decode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// Not enough bytes buffered yet; leave `input` untouched.
    NeedMore,
    /// A frame was removed from `input` and appended to `out`.
    Ok,
    /// The stream is malformed beyond recovery; the connection should
    /// be closed.
    Error,
}

/// Result of `Codec::encode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoded {
    Ok,
    Error,
}

/// The two virtual primitives spec.md §4.15 requires of every codec.
pub trait Codec: Send {
    /// Attempts to remove one framed message from `input`, appending
    /// its payload to `out`. May be called repeatedly to drain several
    /// complete frames buffered back-to-back.
    fn decode(&mut self, input: &mut ByteBuffer, out: &mut Vec<u8>) -> Decoded;

    /// Appends the wire framing for `payload` to `out`.
    fn encode(&mut self, payload: &[u8], out: &mut ByteBuffer) -> Encoded;
}

/// Builds a `TcpConnection` message callback out of a codec and a
/// per-message handler. Drains every complete frame currently buffered
/// (a single read event can carry more than one), and force-closes the
/// connection on a framing error rather than trying to resynchronize.
pub fn message_callback<C>(
    mut codec: C,
    mut on_message: impl FnMut(&mut EventLoop, &mut TcpConnection, Vec<u8>, Instant) + Send + 'static,
) -> MessageCb
where
    C: Codec + 'static,
{
    Box::new(move |event_loop, conn, recv_time| loop {
        let mut payload = Vec::new();
        let status = codec.decode(conn.input_buffer_mut(), &mut payload);
        match status {
            Decoded::Ok => on_message(event_loop, conn, payload, recv_time),
            Decoded::NeedMore => break,
            Decoded::Error => {
                warn!("connection {}: framing error, closing", conn.name());
                conn.force_close(event_loop);
                break;
            }
        }
    })
}
