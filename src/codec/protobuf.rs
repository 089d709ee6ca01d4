//! Typed-message codec: `(int32 name_len, char name[name_len - 1] + NUL,
//! byte payload[..])[, u32 crc32]` wrapped in 4-byte length-prefixed
//! framing — `name_len` counts the trailing NUL, it is not just the
//! name's byte length. Grounded on
//! `original_source/annety/include/codec/ProtobufCodec.h` (CRC32 covers
//! `name_len || name || payload`, matching the wire format in
//! spec.md §6) and spec.md §4.15's typed-message contract, generalized
//! over any `prost::Message + Default` rather than one fixed message
//! type.

use std::collections::HashMap;
use std::time::Instant;

use byteorder::{BigEndian, ByteOrder};
use log::warn;
use prost::Message;

use crate::buffer::ByteBuffer;
use crate::error::FramingError;
use crate::event_loop::EventLoop;
use crate::tcp_connection::{MessageCb, TcpConnection, TcpConnectionHandle};

const HEADER_LEN: u64 = 4;
const CRC_LEN: u64 = 4;
const SHORTEST_NAME: u64 = 2;
const MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

pub struct TypedMessageCodec {
    with_crc: bool,
}

impl TypedMessageCodec {
    pub fn new(with_crc: bool) -> Self {
        TypedMessageCodec { with_crc }
    }

    fn min_payload(&self) -> u64 {
        HEADER_LEN + SHORTEST_NAME + if self.with_crc { CRC_LEN } else { 0 }
    }

    /// Tries to pull one complete frame off `input`, returning the
    /// type name and the raw message bytes. `Ok(None)` means not
    /// enough data buffered yet.
    fn decode_frame(&self, input: &mut ByteBuffer) -> Result<Option<(String, Vec<u8>)>, FramingError> {
        if input.readable_bytes() < 4 {
            return Ok(None);
        }
        let len = BigEndian::read_u32(input.to_slice()) as u64;
        if len < self.min_payload() || len > MAX_PAYLOAD {
            return Err(FramingError::InvalidLength);
        }
        let frame_len = 4 + len as usize;
        if input.readable_bytes() < frame_len {
            return Ok(None);
        }

        let body = &input.to_slice()[4..frame_len];
        let (body, crc_ok) = if self.with_crc {
            let crc_len = CRC_LEN as usize;
            let (payload_part, crc_bytes) = body.split_at(body.len() - crc_len);
            let expected = BigEndian::read_u32(crc_bytes);
            let actual = crc32fast::hash(payload_part);
            (payload_part, expected == actual)
        } else {
            (body, true)
        };
        if !crc_ok {
            return Err(FramingError::CheckSumError);
        }

        if body.len() < 4 {
            return Err(FramingError::InvalidNameLen);
        }
        let name_len = BigEndian::read_u32(body) as usize;
        if name_len < 2 || 4 + name_len > body.len() {
            return Err(FramingError::InvalidNameLen);
        }
        // `name_len` covers the type name plus its trailing NUL.
        let (name_bytes, nul) = body[4..4 + name_len].split_at(name_len - 1);
        if nul != [0u8] {
            return Err(FramingError::InvalidNameLen);
        }
        let name = match std::str::from_utf8(name_bytes) {
            Ok(s) => s.to_string(),
            Err(_) => return Err(FramingError::InvalidNameLen),
        };
        let payload = body[4 + name_len..].to_vec();

        input.has_read(frame_len);
        Ok(Some((name, payload)))
    }

    /// Appends the wire frame for `(type_name, payload)` to `out`.
    fn encode_frame(&self, type_name: &str, payload: &[u8], out: &mut ByteBuffer) {
        let name_bytes = type_name.as_bytes();
        // `name_len` covers the type name plus a trailing NUL, not just
        // the name itself.
        let name_len = name_bytes.len() + 1;
        let body_len = 4 + name_len + payload.len() + if self.with_crc { CRC_LEN as usize } else { 0 };

        let mut len_buf = [0u8; 4];
        BigEndian::write_u32(&mut len_buf, body_len as u32);
        out.append(&len_buf);

        let mut name_len_buf = [0u8; 4];
        BigEndian::write_u32(&mut name_len_buf, name_len as u32);
        out.append(&name_len_buf);
        out.append(name_bytes);
        out.append(&[0u8]);
        out.append(payload);

        if self.with_crc {
            let mut hasher_input = Vec::with_capacity(4 + name_len + payload.len());
            hasher_input.extend_from_slice(&name_len_buf);
            hasher_input.extend_from_slice(name_bytes);
            hasher_input.push(0u8);
            hasher_input.extend_from_slice(payload);
            let crc = crc32fast::hash(&hasher_input);
            let mut crc_buf = [0u8; 4];
            BigEndian::write_u32(&mut crc_buf, crc);
            out.append(&crc_buf);
        }
    }
}

type Handler = Box<dyn Fn(&mut EventLoop, &mut TcpConnection, Instant, &[u8]) + Send + Sync>;

/// Maps wire type names to typed handlers and builds the
/// `TcpConnection` message callback that dispatches to them — the
/// "dispatch table keyed by message type" spec.md §4.15 describes,
/// realized here as a name-keyed map rather than a `TypeId` map since
/// the name is what actually crosses the wire.
pub struct Dispatcher {
    codec: TypedMessageCodec,
    handlers: HashMap<String, Handler>,
}

impl Dispatcher {
    pub fn new(with_crc: bool) -> Self {
        Dispatcher { codec: TypedMessageCodec::new(with_crc), handlers: HashMap::new() }
    }

    /// Registers `handler` for messages of prost type `T` sent under
    /// `type_name`.
    pub fn register<T>(
        &mut self,
        type_name: impl Into<String>,
        handler: impl Fn(&mut EventLoop, &mut TcpConnection, Instant, T) + Send + Sync + 'static,
    ) where
        T: Message + Default,
    {
        self.handlers.insert(
            type_name.into(),
            Box::new(move |event_loop, conn, ts, bytes| match T::decode(bytes) {
                Ok(msg) => handler(event_loop, conn, ts, msg),
                Err(e) => warn!("connection {}: protobuf decode failed: {e}", conn.name()),
            }),
        );
    }

    /// Serializes `msg` and sends it to `conn` under `type_name`.
    pub fn send<T: Message>(&self, conn: &TcpConnectionHandle, type_name: &str, msg: &T) {
        let payload = msg.encode_to_vec();
        let mut out = ByteBuffer::new();
        self.codec.encode_frame(type_name, &payload, &mut out);
        conn.send(out.to_vec());
    }

    /// Consumes the dispatcher into a `TcpConnection` message callback
    /// that decodes every complete frame currently buffered, looks up
    /// its handler by type name, and force-closes the connection on a
    /// framing error (an unrecognized type name is logged and skipped,
    /// not treated as fatal).
    pub fn into_message_callback(mut self) -> MessageCb {
        Box::new(move |event_loop, conn, recv_time| loop {
            match self.codec.decode_frame(conn.input_buffer_mut()) {
                Ok(Some((name, payload))) => match self.handlers.get(&name) {
                    Some(handler) => handler(event_loop, conn, recv_time, &payload),
                    None => warn!("connection {}: unknown message type {name}", conn.name()),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("connection {}: {e}", conn.name());
                    conn.force_close(event_loop);
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame_without_crc() {
        let codec = TypedMessageCodec::new(false);
        let mut wire = ByteBuffer::new();
        codec.encode_frame("ping", b"hello", &mut wire);

        let mut input = ByteBuffer::new();
        input.append(wire.to_slice());
        let (name, payload) = codec.decode_frame(&mut input).unwrap().unwrap();
        assert_eq!(name, "ping");
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn round_trips_a_frame_with_crc() {
        let codec = TypedMessageCodec::new(true);
        let mut wire = ByteBuffer::new();
        codec.encode_frame("pong", b"world", &mut wire);

        let mut input = ByteBuffer::new();
        input.append(wire.to_slice());
        let (name, payload) = codec.decode_frame(&mut input).unwrap().unwrap();
        assert_eq!(name, "pong");
        assert_eq!(payload, b"world");
    }

    #[test]
    fn rejects_corrupted_crc() {
        let codec = TypedMessageCodec::new(true);
        let mut wire = ByteBuffer::new();
        codec.encode_frame("pong", b"world", &mut wire);
        let mut bytes = wire.to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let mut input = ByteBuffer::new();
        input.append(&bytes);
        assert_eq!(codec.decode_frame(&mut input), Err(FramingError::CheckSumError));
    }

    #[test]
    fn needs_more_on_partial_frame() {
        let codec = TypedMessageCodec::new(false);
        let mut wire = ByteBuffer::new();
        codec.encode_frame("ping", b"hello world", &mut wire);
        let mut input = ByteBuffer::new();
        input.append(&wire.to_vec()[..6]);
        assert_eq!(codec.decode_frame(&mut input), Ok(None));
    }
}
