//! Header block codec.
//!
//! A header block is a sequence of `Name: value` lines joined by `\r\n`,
//! without the blank line that terminates it on the wire. Field names are
//! case-sensitive and only the first occurrence of a name is visible
//! through lookups.

use std::fmt;

/// Separator between header lines.
pub const LINE_SEPARATOR: &str = "\r\n";

/// Separator between a field name and its value.
pub const FIELD_SEPARATOR: &str = ": ";

/// Blank-line marker between the header block and the content.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";

/// Header parsing and lookup errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// A line without the `": "` separator
    #[error("malformed header line: {0:?}")]
    MalformedLine(String),
    /// Requested field is absent
    #[error("header field not found: {0}")]
    FieldNotFound(String),
    /// Field value is not a decimal integer
    #[error("header value is not a number: {0:?}")]
    NotANumber(String),
}

/// A parsed header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Raw lines in arrival order.
    lines: Vec<String>,
    /// `(name, value)` pairs in arrival order.
    fields: Vec<(String, String)>,
}

impl Header {
    /// Parse a header block.
    ///
    /// `text` must not contain the header terminator; every line must carry
    /// a `": "` separator.
    pub fn parse(text: &str) -> Result<Self, HeaderError> {
        let mut lines = Vec::new();
        let mut fields = Vec::new();

        for line in text.split(LINE_SEPARATOR) {
            let (name, value) = line
                .split_once(FIELD_SEPARATOR)
                .ok_or_else(|| HeaderError::MalformedLine(line.to_string()))?;

            fields.push((name.to_string(), value.to_string()));
            lines.push(line.to_string());
        }

        Ok(Header { lines, fields })
    }

    /// Value of the first field named exactly `name`.
    pub fn get(&self, name: &str) -> Result<&str, HeaderError> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
            .ok_or_else(|| HeaderError::FieldNotFound(name.to_string()))
    }

    /// Declared content size in bytes.
    pub fn content_length(&self) -> Result<usize, HeaderError> {
        let value = self.get(CONTENT_LENGTH)?;
        value
            .trim()
            .parse()
            .map_err(|_| HeaderError::NotANumber(value.to_string()))
    }

    pub fn content_type(&self) -> Result<&str, HeaderError> {
        self.get(CONTENT_TYPE)
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Declared content length from a header block that may not parse.
///
/// Scans the lines for the first well-formed `Content-Length` field and
/// ignores lines without a separator, so the extent of a message with a
/// malformed header can still be known.
pub fn scan_content_length(text: &str) -> Option<usize> {
    text.split(LINE_SEPARATOR)
        .filter_map(|line| line.split_once(FIELD_SEPARATOR))
        .find(|(name, _)| *name == CONTENT_LENGTH)
        .and_then(|(_, value)| value.trim().parse().ok())
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lines.join(LINE_SEPARATOR))
    }
}
