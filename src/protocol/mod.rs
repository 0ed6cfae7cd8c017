//! Wire protocol types.
//!
//! Messages use the header/content convention of language-server style
//! protocols:
//!
//! ```text
//! Content-Length: 13\r\n
//! Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n
//! \r\n
//! {"a":1,"b":2}
//! ```
//!
//! `Content-Length` is required and counts UTF-8 bytes of the content.
//! Messages may be pipelined back-to-back with no extra separator.

pub mod header;
pub mod message;

pub use header::{Header, HeaderError, HEADER_TERMINATOR};
pub use message::Message;
