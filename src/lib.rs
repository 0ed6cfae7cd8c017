//! lsp-wire: Content-Length message framing and a single-client server
//! lifecycle for editor tooling protocols.
//!
//! - `protocol`: header block parsing and the `Message` value
//! - `runtime`: transport capabilities, receive buffer, and the framer
//! - `server`: lifecycle state machine and its control handle
//! - `dispatch`: where framed messages go
//! - `config`: CLI and TOML configuration

pub mod config;
pub mod dispatch;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use dispatch::{Dispatch, LogDispatch};
pub use protocol::{Header, Message};
pub use server::{Server, ServerOptions, ServerState};
