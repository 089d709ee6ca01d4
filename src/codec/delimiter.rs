//! Delimiter-terminated framing (default `"\r\n"`). Grounded on
//! spec.md §4.15: decode searches from a persistent cursor for the
//! terminator, consuming payload + terminator once found; the cursor
//! is invalidated whenever the buffer compacts or resets (tracked via
//! `ByteBuffer::epoch`).

use crate::buffer::ByteBuffer;
use crate::codec::{Codec, Decoded, Encoded};

const MAX_PAYLOAD_CEILING: usize = 1024 * 1024 * 1024;

pub struct DelimiterCodec {
    terminator: Vec<u8>,
    max_payload: usize,
    /// Offset into the current readable region already scanned with no
    /// match, so re-decoding after `NeedMore` doesn't re-scan bytes.
    cursor: usize,
    cursor_epoch: u64,
}

impl DelimiterCodec {
    pub fn new(max_payload: usize) -> Self {
        DelimiterCodec {
            terminator: b"\r\n".to_vec(),
            max_payload: max_payload.min(MAX_PAYLOAD_CEILING),
            cursor: 0,
            cursor_epoch: 0,
        }
    }

    pub fn with_terminator(mut self, terminator: impl Into<Vec<u8>>) -> Self {
        self.terminator = terminator.into();
        self
    }
}

impl Codec for DelimiterCodec {
    fn decode(&mut self, input: &mut ByteBuffer, out: &mut Vec<u8>) -> Decoded {
        if input.epoch() != self.cursor_epoch {
            self.cursor = 0;
            self.cursor_epoch = input.epoch();
        }

        let data = input.to_slice();
        let start = self.cursor.min(data.len());
        let found = find_subslice(&data[start..], &self.terminator).map(|p| start + p);

        match found {
            Some(pos) => {
                out.extend_from_slice(&data[..pos]);
                let frame_len = pos + self.terminator.len();
                input.has_read(frame_len);
                self.cursor = 0;
                self.cursor_epoch = input.epoch();
                Decoded::Ok
            }
            None => {
                if data.len() > self.max_payload + self.terminator.len() {
                    return Decoded::Error;
                }
                self.cursor = data.len().saturating_sub(self.terminator.len().saturating_sub(1));
                Decoded::NeedMore
            }
        }
    }

    fn encode(&mut self, payload: &[u8], out: &mut ByteBuffer) -> Encoded {
        if payload.len() > self.max_payload {
            return Encoded::Error;
        }
        out.append(payload);
        out.append(&self.terminator);
        Encoded::Ok
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_up_to_terminator() {
        let mut codec = DelimiterCodec::new(1024);
        let mut input = ByteBuffer::new();
        input.append(b"hello\r\nworld");
        let mut out = Vec::new();
        assert_eq!(codec.decode(&mut input, &mut out), Decoded::Ok);
        assert_eq!(out, b"hello");
        assert_eq!(input.to_slice(), b"world");
    }

    #[test]
    fn needs_more_without_terminator() {
        let mut codec = DelimiterCodec::new(1024);
        let mut input = ByteBuffer::new();
        input.append(b"partial");
        let mut out = Vec::new();
        assert_eq!(codec.decode(&mut input, &mut out), Decoded::NeedMore);
    }

    #[test]
    fn errors_past_max_payload() {
        let mut codec = DelimiterCodec::new(4);
        let mut input = ByteBuffer::new();
        input.append(b"way too long with no terminator in sight");
        let mut out = Vec::new();
        assert_eq!(codec.decode(&mut input, &mut out), Decoded::Error);
    }

    #[test]
    fn custom_terminator_round_trips() {
        let mut codec = DelimiterCodec::new(1024).with_terminator(b"|".to_vec());
        let mut wire = ByteBuffer::new();
        assert_eq!(codec.encode(b"abc", &mut wire), Encoded::Ok);
        let mut input = ByteBuffer::new();
        input.append(wire.to_slice());
        let mut out = Vec::new();
        assert_eq!(codec.decode(&mut input, &mut out), Decoded::Ok);
        assert_eq!(out, b"abc");
    }
}
