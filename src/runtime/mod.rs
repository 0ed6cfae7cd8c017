//! Per-connection runtime: transport capabilities, receive buffering, and
//! message framing.
//!
//! - `transport`: the `Listener`/`Connection` capabilities the core needs
//! - `tcp`: mio-based TCP implementation of those capabilities
//! - `buffer`: bounded receive buffer
//! - `framer`: header/content state machine producing `Message`s

pub mod buffer;
pub mod framer;
pub mod tcp;
pub mod transport;

pub use buffer::{BufferOverflow, StreamBuffer};
pub use framer::{FrameError, FrameLimits, MessageFramer};
pub use tcp::{TcpConnection, TcpTransport};
pub use transport::{Connection, ConnectionStatus, Listener, Notify, Readiness};
