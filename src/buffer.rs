//! Growable ring-of-bytes with reader/writer offsets.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! |                   |                  |                  |
//! 0     <=      reader_index   <=   writer_index    <=    capacity
//! ```
//!
//! Invariant: `0 <= reader_index <= writer_index <= capacity`, and if
//! `max_size` is set, `writer_index <= max_size`.

use byteorder::{BigEndian, ByteOrder};
use std::io::{self, IoSliceMut, Read};

pub const INITIAL_SIZE: usize = 1024;
/// Stack-allocated scatter-read extension used by `read_fd` so one syscall
/// can absorb large bursts without pre-growing the buffer.
const EXTRA_BUF_SIZE: usize = 65536;

/// A growable byte buffer used for both the read and write side of a
/// connection, and inside codecs.
#[derive(Clone, Debug)]
pub struct ByteBuffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
    /// Hard cap on `writer_index`; `None` means unlimited.
    max_size: Option<usize>,
    /// Bumped every time the buffer compacts or resets, so callers caching
    /// an offset into the buffer (the delimiter codec's search cursor) can
    /// detect that their cached offset is stale.
    epoch: u64,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ByteBuffer {
            buf: vec![0u8; capacity],
            reader_index: 0,
            writer_index: 0,
            max_size: None,
            epoch: 0,
        }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        let mut b = Self::with_capacity(max_size.min(INITIAL_SIZE));
        b.max_size = Some(max_size);
        b
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Monotonic counter, bumped on compaction/reset. Used by codecs that
    /// cache an offset into the buffer across calls (the delimiter codec)
    /// to invalidate that cache whenever the underlying bytes move.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn begin_read(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.buf[self.writer_index..]
    }

    pub fn has_written(&mut self, len: usize) {
        assert!(self.writable_bytes() >= len);
        self.writer_index += len;
    }

    pub fn has_read(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.reset();
        }
    }

    pub fn has_read_all(&mut self) {
        self.reset();
    }

    pub fn reset(&mut self) {
        self.reader_index = 0;
        self.writer_index = 0;
        self.epoch += 1;
    }

    /// Zero-copy view of the readable region.
    pub fn to_slice(&self) -> &[u8] {
        self.begin_read()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.begin_read().to_vec()
    }

    /// Copies out `len` bytes (or all readable bytes if `None`), then
    /// consumes them.
    pub fn taken_as_vec(&mut self, len: Option<usize>) -> Vec<u8> {
        let len = len.unwrap_or_else(|| self.readable_bytes());
        assert!(len <= self.readable_bytes());
        let out = self.buf[self.reader_index..self.reader_index + len].to_vec();
        self.has_read(len);
        out
    }

    /// Ensures at least `len` bytes are writable, compacting first if the
    /// already-read prefix would free up enough room, else growing
    /// (respecting `max_size`). If growth would exceed `max_size`, this is
    /// a silent no-op — this mirrors the source's observable (lossy)
    /// behavior; see DESIGN.md Open Question 1.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }

        if self.prependable_bytes() + self.writable_bytes() >= len {
            self.compact();
            return;
        }

        let needed = self.writer_index + len;
        if let Some(max) = self.max_size {
            if needed > max {
                #[cfg(feature = "log")]
                log::warn!(
                    "ByteBuffer::ensure_writable_bytes: requested {} bytes would exceed max_size {}, dropping",
                    len,
                    max
                );
                return;
            }
        }
        self.buf.resize(needed.max(self.buf.len() * 2), 0);
    }

    fn compact(&mut self) {
        if self.reader_index == 0 {
            return;
        }
        self.buf.copy_within(self.reader_index..self.writer_index, 0);
        self.writer_index -= self.reader_index;
        self.reader_index = 0;
        self.epoch += 1;
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        if self.writable_bytes() >= data.len() {
            let start = self.writer_index;
            self.buf[start..start + data.len()].copy_from_slice(data);
            self.has_written(data.len());
        }
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    pub fn shrink(&mut self, reserve: usize) {
        let readable = self.readable_bytes();
        let mut new_buf = Vec::with_capacity(readable + reserve);
        new_buf.extend_from_slice(self.begin_read());
        new_buf.resize(new_buf.capacity(), 0);
        self.buf = new_buf;
        self.writer_index = readable;
        self.reader_index = 0;
        self.epoch += 1;
    }

    // -- typed network-order access -----------------------------------

    pub fn peek_i8(&self) -> i8 {
        assert!(self.readable_bytes() >= 1);
        self.begin_read()[0] as i8
    }

    pub fn peek_i16(&self) -> i16 {
        assert!(self.readable_bytes() >= 2);
        BigEndian::read_i16(self.begin_read())
    }

    pub fn peek_i32(&self) -> i32 {
        assert!(self.readable_bytes() >= 4);
        BigEndian::read_i32(self.begin_read())
    }

    pub fn peek_i64(&self) -> i64 {
        assert!(self.readable_bytes() >= 8);
        BigEndian::read_i64(self.begin_read())
    }

    pub fn peek_u32(&self) -> u32 {
        assert!(self.readable_bytes() >= 4);
        BigEndian::read_u32(self.begin_read())
    }

    pub fn read_i8(&mut self) -> i8 {
        let v = self.peek_i8();
        self.has_read(1);
        v
    }

    pub fn read_i16(&mut self) -> i16 {
        let v = self.peek_i16();
        self.has_read(2);
        v
    }

    pub fn read_i32(&mut self) -> i32 {
        let v = self.peek_i32();
        self.has_read(4);
        v
    }

    pub fn read_i64(&mut self) -> i64 {
        let v = self.peek_i64();
        self.has_read(8);
        v
    }

    pub fn append_i8(&mut self, v: i8) {
        self.append(&[v as u8]);
    }

    pub fn append_i16(&mut self, v: i16) {
        let mut b = [0u8; 2];
        BigEndian::write_i16(&mut b, v);
        self.append(&b);
    }

    pub fn append_i32(&mut self, v: i32) {
        let mut b = [0u8; 4];
        BigEndian::write_i32(&mut b, v);
        self.append(&b);
    }

    pub fn append_i64(&mut self, v: i64) {
        let mut b = [0u8; 8];
        BigEndian::write_i64(&mut b, v);
        self.append(&b);
    }

    pub fn append_u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, v);
        self.append(&b);
    }

    /// Scatter-reads from `fd` into the writable region plus a stack
    /// extension, so one syscall can absorb a large burst without
    /// pre-growing the buffer. Returns the number of bytes read (`Ok(0)`
    /// means EOF), or the `io::Error` from the underlying read.
    pub fn read_fd<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let first_slice = &mut self.buf[self.writer_index..];
            let mut slices = [IoSliceMut::new(first_slice), IoSliceMut::new(&mut extra)];
            reader.read_vectored(&mut slices)?
        };

        if n <= writable {
            self.has_written(n);
        } else {
            self.has_written(writable);
            let spill = n - writable;
            self.append(&extra[..spill]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_consume_round_trips() {
        let mut buf = ByteBuffer::new();
        buf.append(b"hello");
        buf.append(b" world");
        assert_eq!(buf.to_slice(), b"hello world");
        assert_eq!(buf.taken_as_vec(Some(5)), b"hello");
        assert_eq!(buf.to_slice(), b" world");
    }

    #[test]
    fn has_read_all_resets_indices() {
        let mut buf = ByteBuffer::new();
        buf.append(b"abc");
        buf.has_read_all();
        assert_eq!(buf.readable_bytes(), 0);
        buf.append(b"xyz");
        assert_eq!(buf.to_slice(), b"xyz");
    }

    #[test]
    fn compaction_preserves_content() {
        let mut buf = ByteBuffer::new();
        buf.append(&vec![1u8; 1000]);
        buf.has_read(900);
        // Force a compaction by requesting more writable space than the
        // tail currently has, but less than prefix + tail combined.
        let before_epoch = buf.epoch();
        buf.ensure_writable_bytes(buf.writable_bytes() + 50);
        assert!(buf.epoch() > before_epoch);
        assert_eq!(buf.readable_bytes(), 100);
    }

    #[test]
    fn network_order_round_trip() {
        let mut buf = ByteBuffer::new();
        buf.append_i8(-12);
        buf.append_i16(-1234);
        buf.append_i32(-123456789);
        buf.append_i64(-1234567890123);
        assert_eq!(buf.read_i8(), -12);
        assert_eq!(buf.read_i16(), -1234);
        assert_eq!(buf.read_i32(), -123456789);
        assert_eq!(buf.read_i64(), -1234567890123);
    }

    #[test]
    fn append_beyond_max_size_is_silently_dropped() {
        let mut buf = ByteBuffer::with_max_size(8);
        buf.append(b"abcdefgh");
        assert_eq!(buf.readable_bytes(), 8);
        buf.append(b"more"); // would exceed max_size
        assert_eq!(buf.readable_bytes(), 8, "append beyond max_size must be dropped, not partial");
    }
}
