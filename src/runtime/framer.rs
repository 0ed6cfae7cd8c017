//! Message framing over a byte stream.
//!
//! The framer pulls whatever bytes the connection has ready, accumulates them
//! in a `StreamBuffer`, and emits a `Message` once a full header block and
//! `Content-Length` bytes of content are buffered. It never assumes reads
//! line up with message boundaries: a message may arrive one byte at a time,
//! or several messages may arrive in a single read.
//!
//! ## States
//!
//! ```text
//!            header terminator found
//! AwaitingHeader ──────────────────────▶ AwaitingContent
//!       ▲                                      │
//!       └──────── content complete ────────────┘
//! ```
//!
//! A wait that times out or is woken returns `Ok(None)` with all partial
//! state kept, so the caller can check for a stop request and call again.

use crate::protocol::header::{scan_content_length, Header, HeaderError, HEADER_TERMINATOR};
use crate::protocol::Message;
use crate::runtime::buffer::{BufferOverflow, StreamBuffer, DEFAULT_MAX_BUFFER_SIZE};
use crate::runtime::transport::{Connection, ConnectionStatus, Readiness};
use std::io;
use std::time::Duration;
use tracing::{debug, trace};

/// Default cap on the header block, terminator excluded.
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;

/// Errors produced while extracting one message.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A header line without `": "`, or a header that is not UTF-8.
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    /// No header terminator within the header size limit.
    #[error("malformed header: no terminator within {limit} bytes")]
    HeaderTooLarge { limit: usize },
    #[error("header has no Content-Length field")]
    MissingContentLength,
    #[error("Content-Length is not a number: {0:?}")]
    NotANumber(String),
    #[error("content is not valid UTF-8: {0}")]
    ContentDecode(#[from] std::str::Utf8Error),
    #[error(transparent)]
    BufferOverflow(#[from] BufferOverflow),
    /// Peer closed between messages.
    #[error("connection closed")]
    ConnectionClosed,
    /// Peer closed part way through a message.
    #[error("connection closed mid-message, {discarded} bytes discarded")]
    Truncated { discarded: usize },
    #[error("connection i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the connection must be dropped.
    ///
    /// Non-fatal errors affect only the current message; the stream is left
    /// positioned after it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            FrameError::MalformedHeader(_)
                | FrameError::MissingContentLength
                | FrameError::NotANumber(_)
                | FrameError::ContentDecode(_)
        )
    }
}

impl From<HeaderError> for FrameError {
    fn from(e: HeaderError) -> Self {
        match e {
            HeaderError::MalformedLine(line) => {
                FrameError::MalformedHeader(format!("line {line:?} has no field separator"))
            }
            HeaderError::FieldNotFound(_) => FrameError::MissingContentLength,
            HeaderError::NotANumber(value) => FrameError::NotANumber(value),
        }
    }
}

/// Size limits and read timeout for one connection.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    /// Longest header block accepted, terminator excluded.
    pub max_header_size: usize,
    /// Most bytes buffered at once, including a full message.
    pub max_buffer_size: usize,
    /// How long a single wait for bytes may block. `None` blocks until bytes
    /// arrive or the wait is woken.
    pub read_timeout: Option<Duration>,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            read_timeout: Some(Duration::from_millis(250)),
        }
    }
}

#[derive(Debug)]
enum FrameState {
    AwaitingHeader,
    AwaitingContent {
        header: String,
        /// Header text plus terminator.
        header_len: usize,
        content_len: usize,
        /// Set when the header was malformed; the message is skipped and
        /// this error returned once its content has arrived.
        rejected: Option<FrameError>,
    },
}

/// Result of one attempt to pull bytes from the connection.
enum Fill {
    Progress,
    Pending,
}

/// Extracts messages from one connection.
pub struct MessageFramer<C> {
    conn: C,
    buffer: StreamBuffer,
    state: FrameState,
    /// Bytes read from the socket past the start of the unconsumed buffer.
    read_position: usize,
    limits: FrameLimits,
}

impl<C: Connection> MessageFramer<C> {
    pub fn new(conn: C, limits: FrameLimits) -> Self {
        Self {
            conn,
            buffer: StreamBuffer::new(limits.max_buffer_size),
            state: FrameState::AwaitingHeader,
            read_position: 0,
            limits,
        }
    }

    /// Extract the next message.
    ///
    /// Returns `Ok(None)` if no message completed before the read wait timed
    /// out or was woken; call again to resume.
    pub fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        loop {
            let fill = match self.state {
                FrameState::AwaitingHeader => {
                    if self.take_header()? {
                        continue;
                    }
                    self.fill(usize::MAX)?
                }
                FrameState::AwaitingContent {
                    ref mut header,
                    header_len,
                    content_len,
                    ref mut rejected,
                } => {
                    let wanted = header_len + content_len;
                    if self.read_position >= wanted {
                        let header = std::mem::take(header);
                        let rejected = rejected.take();
                        self.state = FrameState::AwaitingHeader;
                        if let Some(e) = rejected {
                            self.consume(wanted);
                            return Err(e);
                        }
                        return self.take_content(header, header_len, content_len).map(Some);
                    }
                    self.fill(wanted - self.read_position)?
                }
            };

            if let Fill::Pending = fill {
                return Ok(None);
            }
        }
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Bytes received but not yet returned as part of a message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_connection(self) -> C {
        self.conn
    }

    /// Parse a buffered header if its terminator has arrived.
    ///
    /// Returns whether the state advanced to `AwaitingContent`.
    fn take_header(&mut self) -> Result<bool, FrameError> {
        let Some(end) = self.buffer.find(HEADER_TERMINATOR) else {
            if self.buffer.len() > self.limits.max_header_size + HEADER_TERMINATOR.len() {
                self.discard();
                return Err(FrameError::HeaderTooLarge {
                    limit: self.limits.max_header_size,
                });
            }
            return Ok(false);
        };

        if end > self.limits.max_header_size {
            self.discard();
            return Err(FrameError::HeaderTooLarge {
                limit: self.limits.max_header_size,
            });
        }

        let header_len = end + HEADER_TERMINATOR.len();
        let text = match std::str::from_utf8(&self.buffer.slice_from(0)[..end]) {
            Ok(text) => text.to_string(),
            Err(_) => {
                self.consume(header_len);
                return Err(FrameError::MalformedHeader(
                    "header is not valid UTF-8".to_string(),
                ));
            }
        };

        let (content_len, rejected) = match Header::parse(&text) {
            Ok(header) => match header.content_length() {
                Ok(content_len) => (content_len, None),
                Err(e) => {
                    self.consume(header_len);
                    return Err(e.into());
                }
            },
            // A readable Content-Length still tells us where the next
            // message starts, so skip the content along with the header.
            Err(e) => match scan_content_length(&text) {
                Some(content_len) => (content_len, Some(FrameError::from(e))),
                None => {
                    self.consume(header_len);
                    return Err(e.into());
                }
            },
        };

        let total = header_len.saturating_add(content_len);
        if total > self.buffer.limit() {
            self.discard();
            return Err(BufferOverflow {
                requested: total,
                limit: self.buffer.limit(),
            }
            .into());
        }

        trace!(header_len, content_len, rejected = rejected.is_some(), "Header complete");
        self.state = FrameState::AwaitingContent {
            header: text,
            header_len,
            content_len,
            rejected,
        };
        Ok(true)
    }

    /// Emit the buffered message and trim it from the buffer.
    fn take_content(
        &mut self,
        header: String,
        header_len: usize,
        content_len: usize,
    ) -> Result<Message, FrameError> {
        let content = std::str::from_utf8(
            &self.buffer.slice_from(header_len)[..content_len],
        )
        .map(str::to_string);

        // Consumed even when decoding fails, so corrupt bytes are not re-read.
        self.consume(header_len + content_len);

        Ok(Message::new(header, content?))
    }

    /// Read up to `max` ready bytes into the buffer, waiting if none are ready.
    fn fill(&mut self, max: usize) -> Result<Fill, FrameError> {
        let mut available = self.conn.available_bytes()?;

        if available == 0 && self.conn.status() == ConnectionStatus::Connected {
            match self.conn.wait_readable(self.limits.read_timeout)? {
                Readiness::Ready => available = self.conn.available_bytes()?,
                Readiness::TimedOut | Readiness::Woken => return Ok(Fill::Pending),
            }
        }

        if available == 0 {
            return match self.conn.status() {
                ConnectionStatus::Connected => Ok(Fill::Pending),
                _ => self.closed(),
            };
        }

        // Never read past the cap; a full buffer with no message in it is fatal.
        let want = available.min(max).min(self.buffer.remaining());
        if let Err(e) = self.buffer.check_room(want.max(1)) {
            self.discard();
            return Err(e.into());
        }

        let bytes = self.conn.read(want)?;
        if bytes.is_empty() {
            return match self.conn.status() {
                ConnectionStatus::Connected => Ok(Fill::Pending),
                _ => self.closed(),
            };
        }

        self.buffer.append(&bytes)?;
        self.read_position += bytes.len();
        trace!(read = bytes.len(), buffered = self.buffer.len(), "Read bytes");

        Ok(Fill::Progress)
    }

    fn closed(&mut self) -> Result<Fill, FrameError> {
        let discarded = self.buffer.len();
        self.discard();
        if discarded > 0 {
            debug!(discarded, "Connection closed mid-message");
            return Err(FrameError::Truncated { discarded });
        }
        Err(FrameError::ConnectionClosed)
    }

    fn consume(&mut self, len: usize) {
        let removed = self.buffer.consume_prefix(len);
        self.read_position -= removed;
        debug_assert_eq!(self.read_position, self.buffer.len());
    }

    fn discard(&mut self) {
        self.buffer.clear();
        self.read_position = 0;
        self.state = FrameState::AwaitingHeader;
    }
}
