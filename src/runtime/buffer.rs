//! Per-connection receive buffer.
//!
//! Bytes read from the socket are appended at the tail; once a message has
//! been extracted its bytes are trimmed from the front. Anything past the
//! extracted message belongs to the next pipelined message and stays put.
//!
//! The buffer is capped: a peer that never sends a header terminator (or
//! declares an enormous content length) hits `BufferOverflow` instead of
//! growing memory without bound.

use bytes::{Buf, BytesMut};
use tracing::warn;

/// Default cap on buffered bytes per connection.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Initial allocation; grows on demand up to the cap.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// Error returned when an append would exceed the buffer cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("buffer overflow: {requested} bytes requested, limit is {limit}")]
pub struct BufferOverflow {
    /// Total size the buffer would have reached.
    pub requested: usize,
    /// Configured cap.
    pub limit: usize,
}

/// Append-only-then-trim byte accumulator.
#[derive(Debug)]
pub struct StreamBuffer {
    data: BytesMut,
    limit: usize,
}

impl StreamBuffer {
    /// Create an empty buffer holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(INITIAL_CAPACITY.min(limit)),
            limit,
        }
    }

    /// Append bytes at the tail.
    ///
    /// Fails without modifying the buffer if the result would exceed the cap.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferOverflow> {
        self.check_room(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Check whether `additional` more bytes would fit.
    pub fn check_room(&self, additional: usize) -> Result<(), BufferOverflow> {
        let requested = self.data.len().saturating_add(additional);
        if requested > self.limit {
            return Err(BufferOverflow {
                requested,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Offset of the first occurrence of `separator`, scanning from the start.
    pub fn find(&self, separator: &[u8]) -> Option<usize> {
        if separator.is_empty() {
            return Some(0);
        }
        self.data
            .windows(separator.len())
            .position(|window| window == separator)
    }

    /// Remove `len` bytes from the front.
    ///
    /// Removing more than is buffered empties the buffer. Returns the number
    /// of bytes actually removed.
    pub fn consume_prefix(&mut self, len: usize) -> usize {
        let available = self.data.len();
        if len > available {
            warn!(
                requested = len,
                buffered = available,
                "Consume past end of buffer, clamping"
            );
        }
        let removed = len.min(available);
        self.data.advance(removed);
        removed
    }

    /// Bytes from `offset` to the end, without consuming them.
    ///
    /// Returns an empty slice if `offset` is past the end.
    pub fn slice_from(&self, offset: usize) -> &[u8] {
        self.data.get(offset..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes that can still be appended before hitting the cap.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.data.len())
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_SIZE)
    }
}
