//! Length-prefixed framing: a fixed-width, network-order length field
//! followed by that many payload bytes. Grounded on
//! `original_source/annety/include/codec/LengthHeaderCodec.h` and
//! spec.md §4.15/§4.9 [Open Question resolved] (SPEC_FULL.md §4.15):
//! the prefix carries the payload length only, not the frame's total
//! length.

use byteorder::{BigEndian, ByteOrder};

use crate::buffer::ByteBuffer;
use crate::codec::{Codec, Decoded, Encoded};

/// Width of the length prefix, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixWidth {
    One,
    Two,
    Four,
    Eight,
}

impl PrefixWidth {
    fn bytes(self) -> usize {
        match self {
            PrefixWidth::One => 1,
            PrefixWidth::Two => 2,
            PrefixWidth::Four => 4,
            PrefixWidth::Eight => 8,
        }
    }

    fn read(self, buf: &[u8]) -> u64 {
        match self {
            PrefixWidth::One => buf[0] as u64,
            PrefixWidth::Two => BigEndian::read_u16(buf) as u64,
            PrefixWidth::Four => BigEndian::read_u32(buf) as u64,
            PrefixWidth::Eight => BigEndian::read_u64(buf),
        }
    }

    fn write(self, len: u64, out: &mut [u8]) {
        match self {
            PrefixWidth::One => out[0] = len as u8,
            PrefixWidth::Two => BigEndian::write_u16(out, len as u16),
            PrefixWidth::Four => BigEndian::write_u32(out, len as u32),
            PrefixWidth::Eight => BigEndian::write_u64(out, len),
        }
    }
}

pub struct LengthPrefixedCodec {
    prefix: PrefixWidth,
    min_payload: u64,
    max_payload: u64,
}

impl LengthPrefixedCodec {
    pub fn new(prefix: PrefixWidth, min_payload: u64, max_payload: u64) -> Self {
        LengthPrefixedCodec { prefix, min_payload, max_payload }
    }
}

impl Codec for LengthPrefixedCodec {
    fn decode(&mut self, input: &mut ByteBuffer, out: &mut Vec<u8>) -> Decoded {
        let width = self.prefix.bytes();
        if input.readable_bytes() < width {
            return Decoded::NeedMore;
        }

        // Peek: do not consume the prefix until the whole frame is present.
        let len = self.prefix.read(input.to_slice());
        if len < self.min_payload || len > self.max_payload {
            return Decoded::Error;
        }

        let frame_len = width + len as usize;
        if input.readable_bytes() < frame_len {
            return Decoded::NeedMore;
        }

        out.extend_from_slice(&input.to_slice()[width..frame_len]);
        input.has_read(frame_len);
        Decoded::Ok
    }

    fn encode(&mut self, payload: &[u8], out: &mut ByteBuffer) -> Encoded {
        if (payload.len() as u64) < self.min_payload || payload.len() as u64 > self.max_payload {
            return Encoded::Error;
        }
        let width = self.prefix.bytes();
        let mut prefix = [0u8; 8];
        self.prefix.write(payload.len() as u64, &mut prefix[..width]);
        out.append(&prefix[..width]);
        out.append(payload);
        Encoded::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_complete_frame() {
        let mut codec = LengthPrefixedCodec::new(PrefixWidth::Four, 0, 1024);
        let mut input = ByteBuffer::new();
        input.append(&4u32.to_be_bytes());
        input.append(b"ping");
        let mut out = Vec::new();
        assert_eq!(codec.decode(&mut input, &mut out), Decoded::Ok);
        assert_eq!(out, b"ping");
        assert_eq!(input.readable_bytes(), 0);
    }

    #[test]
    fn needs_more_on_partial_frame() {
        let mut codec = LengthPrefixedCodec::new(PrefixWidth::Four, 0, 1024);
        let mut input = ByteBuffer::new();
        input.append(&10u32.to_be_bytes());
        input.append(b"abc");
        let mut out = Vec::new();
        assert_eq!(codec.decode(&mut input, &mut out), Decoded::NeedMore);
        assert_eq!(input.readable_bytes(), 4 + 3, "partial frame must stay buffered");
    }

    #[test]
    fn rejects_oversized_length() {
        let mut codec = LengthPrefixedCodec::new(PrefixWidth::Four, 0, 8);
        let mut input = ByteBuffer::new();
        input.append(&100u32.to_be_bytes());
        let mut out = Vec::new();
        assert_eq!(codec.decode(&mut input, &mut out), Decoded::Error);
    }

    #[test]
    fn encode_round_trips_through_decode() {
        let mut codec = LengthPrefixedCodec::new(PrefixWidth::Two, 0, 1024);
        let mut wire = ByteBuffer::new();
        assert_eq!(codec.encode(b"hello", &mut wire), Encoded::Ok);

        let mut input = ByteBuffer::new();
        input.append(wire.to_slice());
        let mut out = Vec::new();
        assert_eq!(codec.decode(&mut input, &mut out), Decoded::Ok);
        assert_eq!(out, b"hello");
    }
}
