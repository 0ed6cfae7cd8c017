//! TCP transport on mio.
//!
//! One `Poll` serves both the listening socket and the (single) accepted
//! connection. A `Waker` registered on the same poll lets the controller
//! interrupt any wait, so a stop request does not have to sit out a read
//! timeout.

use crate::runtime::transport::{Connection, ConnectionStatus, Listener, Notify, Readiness};
use bytes::{Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const WAKER_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);
const CONNECTION_TOKEN: Token = Token(2);

/// Largest single read from the socket.
const MAX_READ_SIZE: usize = 64 * 1024;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 128;

struct Reactor {
    poll: Poll,
    events: Events,
}

impl Reactor {
    /// Wait for an event on `token`.
    ///
    /// Events for other tokens are dropped; the listener compensates by
    /// retrying `accept` after each connection.
    fn wait(&mut self, token: Token, timeout: Option<Duration>) -> io::Result<Readiness> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Readiness::Woken),
            Err(e) => return Err(e),
        }

        let mut readiness = Readiness::TimedOut;
        for event in self.events.iter() {
            if event.token() == token {
                return Ok(Readiness::Ready);
            }
            if event.token() == WAKER_TOKEN {
                readiness = Readiness::Woken;
            }
        }
        Ok(readiness)
    }
}

/// Listening TCP socket plus the reactor its connections are polled on.
pub struct TcpTransport {
    reactor: Reactor,
    waker: Arc<Waker>,
    host: String,
    backlog: i32,
    listener: Option<TcpListener>,
    /// More connections may be queued behind the last one accepted.
    accept_pending: bool,
}

impl TcpTransport {
    /// Create a transport that will bind to `host` when asked to listen.
    pub fn new(host: impl Into<String>, backlog: i32) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            reactor: Reactor {
                poll,
                events: Events::with_capacity(16),
            },
            waker,
            host: host.into(),
            backlog,
            listener: None,
            accept_pending: false,
        })
    }

    /// Address of the listening socket, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

impl Listener for TcpTransport {
    type Conn<'a> = TcpConnection<'a>;

    fn listen(&mut self, port: u16) -> io::Result<()> {
        self.close();

        let addr = (self.host.as_str(), port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("host {:?} did not resolve", self.host),
                )
            })?;

        let mut listener = TcpListener::from_std(create_listener(addr, self.backlog)?);
        self.reactor
            .poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        info!(addr = %addr, "Listening");
        self.listener = Some(listener);
        self.accept_pending = false;
        Ok(())
    }

    fn poll_connection(&mut self, timeout: Duration) -> io::Result<Readiness> {
        if self.listener.is_none() {
            return Err(not_listening());
        }
        if self.accept_pending {
            return Ok(Readiness::Ready);
        }
        self.reactor.wait(LISTENER_TOKEN, Some(timeout))
    }

    fn accept(&mut self) -> io::Result<Option<TcpConnection<'_>>> {
        let listener = self.listener.as_ref().ok_or_else(not_listening)?;

        loop {
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    self.accept_pending = true;
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    self.reactor.poll.registry().register(
                        &mut stream,
                        CONNECTION_TOKEN,
                        Interest::READABLE,
                    )?;

                    return Ok(Some(TcpConnection {
                        stream,
                        reactor: &mut self.reactor,
                        peer,
                        status: ConnectionStatus::Connected,
                    }));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.accept_pending = false;
                    return Ok(None);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            let _ = self.reactor.poll.registry().deregister(&mut listener);
            debug!("Listener closed");
        }
        self.accept_pending = false;
    }

    fn notifier(&self) -> Arc<dyn Notify> {
        self.waker.clone()
    }
}

/// An accepted TCP connection.
///
/// Borrows the transport's reactor; dropping it deregisters and closes the
/// socket.
pub struct TcpConnection<'a> {
    stream: TcpStream,
    reactor: &'a mut Reactor,
    peer: SocketAddr,
    status: ConnectionStatus,
}

impl TcpConnection<'_> {
    /// Distinguish "nothing ready" from "peer closed" when no bytes are queued.
    fn probe_closed(&mut self) -> io::Result<()> {
        let mut byte = [0u8; 1];
        match self.stream.peek(&mut byte) {
            Ok(0) => self.status = ConnectionStatus::Disconnected,
            Ok(_) => {}
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(ref e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::ConnectionAborted =>
            {
                self.status = ConnectionStatus::Disconnected;
            }
            Err(e) => {
                self.status = ConnectionStatus::Error;
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Connection for TcpConnection<'_> {
    fn status(&self) -> ConnectionStatus {
        self.status
    }

    fn available_bytes(&mut self) -> io::Result<usize> {
        if self.status != ConnectionStatus::Connected {
            return Ok(0);
        }

        let mut count: libc::c_int = 0;
        // SAFETY: FIONREAD stores a single c_int through the pointer.
        let rc = unsafe {
            libc::ioctl(
                self.stream.as_raw_fd(),
                libc::FIONREAD,
                &mut count as *mut libc::c_int,
            )
        };
        if rc < 0 {
            self.status = ConnectionStatus::Error;
            return Err(io::Error::last_os_error());
        }

        if count == 0 {
            self.probe_closed()?;
        }
        Ok(count.max(0) as usize)
    }

    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<Readiness> {
        self.reactor.wait(CONNECTION_TOKEN, timeout)
    }

    fn read(&mut self, max: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(max.min(MAX_READ_SIZE));

        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.status = ConnectionStatus::Disconnected;
                    return Ok(Bytes::new());
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf.freeze());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Bytes::new()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.status = ConnectionStatus::Error;
                    return Err(e);
                }
            }
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

impl Drop for TcpConnection<'_> {
    fn drop(&mut self) {
        let _ = self.reactor.poll.registry().deregister(&mut self.stream);
    }
}

fn not_listening() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not listening")
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
