//! Socket capabilities required by the framer and the lifecycle.
//!
//! The lifecycle only needs to listen, wait for and accept one connection,
//! and the framer only needs to ask how many bytes are ready, wait for more,
//! and read them. `TcpTransport` implements these over mio; tests use the
//! in-memory implementations in `testing`.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The awaited event happened.
    Ready,
    /// The timeout elapsed first.
    TimedOut,
    /// The wait was interrupted by a `Notify` wakeup.
    Woken,
}

/// Connection status as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    /// Peer closed its side.
    Disconnected,
    /// The socket reported an error.
    Error,
}

/// Wakes a worker blocked in a transport wait.
pub trait Notify: Send + Sync {
    fn notify(&self) -> io::Result<()>;
}

impl Notify for mio::Waker {
    fn notify(&self) -> io::Result<()> {
        self.wake()
    }
}

/// An accepted byte stream.
pub trait Connection {
    fn status(&self) -> ConnectionStatus;

    /// Number of bytes that can be read right now without blocking.
    ///
    /// Returns 0 when nothing is ready; a closed peer is reported through
    /// `status` afterwards.
    fn available_bytes(&mut self) -> io::Result<usize>;

    /// Block until bytes are ready, the timeout elapses, or a wakeup arrives.
    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<Readiness>;

    /// Read up to `max` bytes that are ready now.
    ///
    /// Returns an empty buffer when nothing is ready or the peer closed.
    fn read(&mut self, max: usize) -> io::Result<Bytes>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// A listening socket that hands out one connection at a time.
///
/// `accept` borrows the listener for as long as the connection lives, so a
/// second connection cannot be held while one is being served.
pub trait Listener: Send + 'static {
    type Conn<'a>: Connection
    where
        Self: 'a;

    /// Bind and listen on `port`, replacing any previous listening socket.
    fn listen(&mut self, port: u16) -> io::Result<()>;

    /// Wait until a connection may be accepted.
    fn poll_connection(&mut self, timeout: Duration) -> io::Result<Readiness>;

    /// Accept a pending connection, if any.
    fn accept(&mut self) -> io::Result<Option<Self::Conn<'_>>>;

    /// Release the listening socket.
    fn close(&mut self);

    /// Handle used by the controller to interrupt waits on this listener and
    /// its connections.
    fn notifier(&self) -> Arc<dyn Notify>;
}
