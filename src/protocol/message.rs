//! Framed message value and its wire encoding.

use super::header::{Header, HeaderError, CONTENT_LENGTH, CONTENT_TYPE, HEADER_TERMINATOR};
use bytes::{BufMut, Bytes, BytesMut};

/// One complete message as extracted from the stream.
///
/// `header` is the raw header block (without the terminator) and `content`
/// is exactly `Content-Length` bytes decoded as UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: String,
    content: String,
}

impl Message {
    /// Create a message from already-framed parts.
    pub fn new(header: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            content: content.into(),
        }
    }

    /// Build a message around `content` with a matching `Content-Length`.
    pub fn with_content(content: impl Into<String>) -> Self {
        let content = content.into();
        let header = format!("{CONTENT_LENGTH}: {}", content.len());
        Self { header, content }
    }

    /// Build a message with both `Content-Length` and `Content-Type`.
    pub fn with_content_type(content: impl Into<String>, content_type: &str) -> Self {
        let content = content.into();
        let header = format!(
            "{CONTENT_LENGTH}: {}\r\n{CONTENT_TYPE}: {content_type}",
            content.len()
        );
        Self { header, content }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Parse the header block into fields.
    pub fn fields(&self) -> Result<Header, HeaderError> {
        Header::parse(&self.header)
    }

    /// Split into `(header, content)` without copying.
    pub fn into_parts(self) -> (String, String) {
        (self.header, self.content)
    }

    /// Encode to wire form: header, blank line, content.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(
            self.header.len() + HEADER_TERMINATOR.len() + self.content.len(),
        );
        out.put_slice(self.header.as_bytes());
        out.put_slice(HEADER_TERMINATOR);
        out.put_slice(self.content.as_bytes());
        out.freeze()
    }
}
