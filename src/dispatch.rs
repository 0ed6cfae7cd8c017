//! Hand-off point between framing and the request layer.
//!
//! The server does not interpret message content. Every framed message and
//! every per-message error is passed to a `Dispatch` implementation, which
//! owns what happens next.

use crate::protocol::Message;
use crate::runtime::FrameError;
use std::net::SocketAddr;
use std::sync::mpsc::Sender;
use tracing::{debug, info, trace, warn};

/// Consumer of framed messages.
///
/// Called on the server's worker thread, one connection at a time.
pub trait Dispatch: Send + 'static {
    /// A complete message arrived.
    fn on_message(&mut self, message: Message);

    /// Extracting a message failed.
    ///
    /// Non-fatal errors are followed by further messages from the same
    /// connection; after a fatal one the connection is dropped.
    fn on_error(&mut self, error: &FrameError) {
        let _ = error;
    }

    fn on_connect(&mut self, peer: Option<SocketAddr>) {
        let _ = peer;
    }

    fn on_disconnect(&mut self) {}
}

/// Dispatcher that only logs what it receives.
#[derive(Debug, Default)]
pub struct LogDispatch {
    received: u64,
}

impl LogDispatch {
    pub fn received(&self) -> u64 {
        self.received
    }
}

impl Dispatch for LogDispatch {
    fn on_message(&mut self, message: Message) {
        self.received += 1;
        debug!(
            seq = self.received,
            header = %message.header(),
            bytes = message.content().len(),
            "Message received"
        );
        trace!(content = %message.content(), "Message content");
    }

    fn on_error(&mut self, error: &FrameError) {
        warn!(error = %error, fatal = error.is_fatal(), "Message dropped");
    }

    fn on_connect(&mut self, peer: Option<SocketAddr>) {
        match peer {
            Some(peer) => info!(peer = %peer, "Client connected"),
            None => info!("Client connected"),
        }
    }

    fn on_disconnect(&mut self) {
        info!(received = self.received, "Client disconnected");
    }
}

/// Events forwarded by the channel dispatcher.
#[derive(Debug)]
pub enum DispatchEvent {
    Connected(Option<SocketAddr>),
    Message(Message),
    /// Display form of the error and whether it was fatal.
    Error { error: String, fatal: bool },
    Disconnected,
}

/// Forwards everything to another thread; send failures are ignored once the
/// receiver is gone.
impl Dispatch for Sender<DispatchEvent> {
    fn on_message(&mut self, message: Message) {
        let _ = self.send(DispatchEvent::Message(message));
    }

    fn on_error(&mut self, error: &FrameError) {
        let _ = self.send(DispatchEvent::Error {
            error: error.to_string(),
            fatal: error.is_fatal(),
        });
    }

    fn on_connect(&mut self, peer: Option<SocketAddr>) {
        let _ = self.send(DispatchEvent::Connected(peer));
    }

    fn on_disconnect(&mut self) {
        let _ = self.send(DispatchEvent::Disconnected);
    }
}
