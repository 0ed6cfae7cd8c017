//! Connection lifecycle.
//!
//! A `Server` owns one worker thread that runs the lifecycle state machine:
//!
//! ```text
//! Idle ──Start(port)──▶ Starting ──listen ok──▶ WaitingForConnection
//!                          ▲  │                      │        ▲
//!                retry w/  └──┘ listen failed        │accept  │ connection ended
//!                backoff                             ▼        │
//!                                                 Serving ────┘
//!
//! Stop (from any state) ──▶ Stopping (terminal)
//! ```
//!
//! The handle talks to the worker only through a command channel. Every
//! command is followed by a transport wakeup, so a worker blocked waiting
//! for a client or for bytes sees it immediately.

use crate::dispatch::Dispatch;
use crate::runtime::{
    Connection, FrameError, FrameLimits, Listener, MessageFramer, Notify, Readiness,
};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Consecutive accept failures after which each further one is an `error!`
/// when listen retries are unbounded.
const ACCEPT_ERROR_THRESHOLD: u32 = 10;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Idle = 0,
    Starting = 1,
    WaitingForConnection = 2,
    Serving = 3,
    Stopping = 4,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Idle,
            1 => ServerState::Starting,
            2 => ServerState::WaitingForConnection,
            3 => ServerState::Serving,
            _ => ServerState::Stopping,
        }
    }
}

/// Commands sent from the handle to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start(u16),
    Stop,
}

/// Errors from the control handle.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to spawn server worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("server worker has stopped")]
    Stopped,
}

/// Retry schedule for listen and accept failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Listen attempts before giving up; 0 retries forever.
    pub listen_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): doubles from
    /// `initial_backoff`, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            listen_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Worker settings.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub limits: FrameLimits,
    /// Longest single wait for an incoming connection.
    pub poll_interval: Duration,
    /// Stop after the first connection ends instead of accepting another.
    pub single_session: bool,
    pub retry: RetryPolicy,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            limits: FrameLimits::default(),
            poll_interval: Duration::from_millis(50),
            single_session: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Status published by the worker.
struct Shared {
    state: AtomicU8,
    active: AtomicBool,
    running: AtomicBool,
    port: AtomicU16,
}

impl Shared {
    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Control handle for a server instance.
///
/// Dropping the handle stops the worker and waits for it to exit.
pub struct Server {
    commands: Sender<Command>,
    notify: Arc<dyn Notify>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Server {
    /// Spawn the worker thread. The server starts `Idle`; call `start` to
    /// begin listening.
    pub fn spawn<L, D>(listener: L, dispatcher: D, options: ServerOptions) -> Result<Self, ServerError>
    where
        L: Listener,
        D: Dispatch,
    {
        let (commands, receiver) = mpsc::channel();
        let notify = listener.notifier();
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ServerState::Idle as u8),
            active: AtomicBool::new(false),
            running: AtomicBool::new(true),
            port: AtomicU16::new(0),
        });

        let lifecycle = Lifecycle {
            listener,
            dispatcher,
            control: Control {
                commands: receiver,
                shared: Arc::clone(&shared),
                options,
                port: 0,
                listen_attempt: 0,
                accept_failures: 0,
            },
        };

        let worker = thread::Builder::new()
            .name("lsp-wire-worker".to_string())
            .spawn(move || lifecycle.run())?;

        Ok(Server {
            commands,
            notify,
            shared,
            worker: Some(worker),
        })
    }

    /// Ask the worker to listen on `port`.
    ///
    /// While already listening on another port, the current connection is
    /// dropped and the server re-listens on the new one.
    pub fn start(&self, port: u16) -> Result<(), ServerError> {
        self.shared.port.store(port, Ordering::Release);
        self.send(Command::Start(port))
    }

    /// Ask the worker to stop. Takes effect at the worker's next wakeup.
    pub fn stop(&self) {
        if self.send(Command::Stop).is_err() {
            debug!("Stop requested after worker exit");
        }
    }

    /// Listening for connections (or serving one).
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Worker has not reached `Stopping`.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Port most recently passed to `start`.
    pub fn port(&self) -> u16 {
        self.shared.port.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Wait for the worker to exit without asking it to stop.
    pub fn join(mut self) {
        self.join_worker();
    }

    fn send(&self, command: Command) -> Result<(), ServerError> {
        self.commands
            .send(command)
            .map_err(|_| ServerError::Stopped)?;
        if let Err(e) = self.notify.notify() {
            warn!(error = %e, "Failed to wake server worker");
        }
        Ok(())
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Server worker panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
            self.join_worker();
        }
    }
}

/// Worker-side command handling and status.
struct Control {
    commands: Receiver<Command>,
    shared: Arc<Shared>,
    options: ServerOptions,
    port: u16,
    listen_attempt: u32,
    accept_failures: u32,
}

impl Control {
    /// Apply a pending command, if any. Returns the state it leads to.
    fn poll_command(&mut self) -> Option<ServerState> {
        match self.commands.try_recv() {
            Ok(command) => self.apply(command),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(ServerState::Stopping),
        }
    }

    /// Like `poll_command`, but waits up to `timeout` for a command.
    fn wait_command(&mut self, timeout: Duration) -> Option<ServerState> {
        match self.commands.recv_timeout(timeout) {
            Ok(command) => self.apply(command),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(ServerState::Stopping),
        }
    }

    fn apply(&mut self, command: Command) -> Option<ServerState> {
        match command {
            Command::Stop => {
                info!("Stop requested");
                Some(ServerState::Stopping)
            }
            Command::Start(port)
                if port == self.port && self.shared.active.load(Ordering::Acquire) =>
            {
                debug!(port, "Already listening");
                None
            }
            Command::Start(port) => {
                self.port = port;
                self.listen_attempt = 0;
                Some(ServerState::Starting)
            }
        }
    }

    fn after_disconnect(&self) -> ServerState {
        if self.options.single_session {
            info!("Session ended, stopping");
            ServerState::Stopping
        } else {
            ServerState::WaitingForConnection
        }
    }

    /// Back off after an accept-side failure, honoring commands meanwhile.
    fn accept_backoff(&mut self, error: &std::io::Error) -> ServerState {
        self.accept_failures += 1;
        let delay = self.options.retry.backoff(self.accept_failures);
        if self.accept_failures_persistent() {
            error!(
                failures = self.accept_failures,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Accept keeps failing"
            );
        } else {
            warn!(
                failures = self.accept_failures,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Accept failed"
            );
        }
        self.wait_command(delay)
            .unwrap_or(ServerState::WaitingForConnection)
    }

    fn accept_failures_persistent(&self) -> bool {
        let threshold = match self.options.retry.listen_attempts {
            0 => ACCEPT_ERROR_THRESHOLD,
            attempts => attempts,
        };
        self.accept_failures >= threshold
    }
}

struct Lifecycle<L, D> {
    listener: L,
    dispatcher: D,
    control: Control,
}

impl<L: Listener, D: Dispatch> Lifecycle<L, D> {
    fn run(mut self) {
        debug!("Server worker started");
        let mut state = ServerState::Idle;

        loop {
            self.control.shared.set_state(state);
            state = match state {
                ServerState::Idle => self.idle(),
                ServerState::Starting => self.starting(),
                // Serving is entered from inside wait_for_connection, which
                // holds the accepted connection.
                ServerState::WaitingForConnection | ServerState::Serving => {
                    self.wait_for_connection()
                }
                ServerState::Stopping => {
                    self.stopping();
                    break;
                }
            };
        }
    }

    fn idle(&mut self) -> ServerState {
        match self.control.commands.recv() {
            Ok(command) => self.control.apply(command).unwrap_or(ServerState::Idle),
            Err(_) => ServerState::Stopping,
        }
    }

    fn starting(&mut self) -> ServerState {
        self.control.shared.active.store(false, Ordering::Release);
        let port = self.control.port;

        match self.listener.listen(port) {
            Ok(()) => {
                self.control.listen_attempt = 0;
                self.control.accept_failures = 0;
                self.control.shared.active.store(true, Ordering::Release);
                info!(port, "Server started");
                ServerState::WaitingForConnection
            }
            Err(e) => {
                self.control.listen_attempt += 1;
                let attempt = self.control.listen_attempt;
                let retry = self.control.options.retry;

                if retry.listen_attempts > 0 && attempt >= retry.listen_attempts {
                    error!(port, attempts = attempt, error = %e, "Failed to listen, giving up");
                    return ServerState::Stopping;
                }

                let delay = retry.backoff(attempt);
                warn!(
                    port,
                    attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Failed to listen"
                );
                self.control
                    .wait_command(delay)
                    .unwrap_or(ServerState::Starting)
            }
        }
    }

    fn wait_for_connection(&mut self) -> ServerState {
        if let Some(next) = self.control.poll_command() {
            return next;
        }

        let Lifecycle {
            listener,
            dispatcher,
            control,
        } = self;

        match listener.poll_connection(control.options.poll_interval) {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::TimedOut | Readiness::Woken) => {
                return ServerState::WaitingForConnection;
            }
            Err(e) => return control.accept_backoff(&e),
        }

        match listener.accept() {
            Ok(Some(conn)) => {
                control.accept_failures = 0;
                serve(conn, dispatcher, control)
            }
            Ok(None) => ServerState::WaitingForConnection,
            Err(e) => control.accept_backoff(&e),
        }
    }

    fn stopping(&mut self) {
        self.listener.close();
        let shared = &self.control.shared;
        shared.active.store(false, Ordering::Release);
        shared.running.store(false, Ordering::Release);
        shared.set_state(ServerState::Stopping);
        info!(port = self.control.port, "Server stopped");
    }
}

/// Frame and dispatch messages until the connection ends or a command
/// arrives.
fn serve<C, D>(conn: C, dispatcher: &mut D, control: &mut Control) -> ServerState
where
    C: Connection,
    D: Dispatch,
{
    control.shared.set_state(ServerState::Serving);
    let peer = conn.peer_addr();
    dispatcher.on_connect(peer);

    let mut framer = MessageFramer::new(conn, control.options.limits);

    let next = loop {
        if let Some(next) = control.poll_command() {
            break next;
        }

        match framer.next_message() {
            Ok(Some(message)) => dispatcher.on_message(message),
            Ok(None) => {}
            Err(FrameError::ConnectionClosed) => {
                debug!(peer = ?peer, "Connection closed by peer");
                break control.after_disconnect();
            }
            Err(e) if !e.is_fatal() => {
                debug!(peer = ?peer, error = %e, "Dropping malformed message");
                dispatcher.on_error(&e);
            }
            Err(e) => {
                warn!(peer = ?peer, error = %e, "Dropping connection");
                dispatcher.on_error(&e);
                break control.after_disconnect();
            }
        }
    };

    dispatcher.on_disconnect();
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchEvent;
    use crate::protocol::Message;
    use crate::runtime::transport::testing::{chunked, Chunk, ScriptedListener};
    use crate::runtime::TcpTransport;
    use std::io::Write;
    use std::sync::mpsc::Receiver;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn fast_options() -> ServerOptions {
        ServerOptions {
            poll_interval: Duration::from_millis(5),
            retry: RetryPolicy {
                listen_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
            ..ServerOptions::default()
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn next_event(rx: &Receiver<DispatchEvent>) -> DispatchEvent {
        rx.recv_timeout(TIMEOUT).unwrap()
    }

    fn expect_message(rx: &Receiver<DispatchEvent>) -> Message {
        match next_event(rx) {
            DispatchEvent::Message(msg) => msg,
            other => panic!("expected message, got {:?}", other),
        }
    }

    fn wire(content: &str) -> Vec<u8> {
        Message::with_content(content).encode().to_vec()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            listen_attempts: 0,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        assert_eq!(retry.backoff(0), Duration::ZERO);
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(4), Duration::from_millis(800));
        assert_eq!(retry.backoff(5), Duration::from_millis(1000));
        assert_eq!(retry.backoff(100), Duration::from_millis(1000));
    }

    #[test]
    fn test_stop_from_idle() {
        let listener = ScriptedListener::idle();
        let listen_calls = Arc::clone(&listener.listen_calls);
        let (tx, _rx) = mpsc::channel();

        let server = Server::spawn(listener, tx, fast_options()).unwrap();
        assert_eq!(server.state(), ServerState::Idle);
        assert!(!server.is_active());

        server.stop();
        assert!(wait_until(|| !server.is_running()));
        assert_eq!(server.state(), ServerState::Stopping);
        assert_eq!(listen_calls.load(Ordering::SeqCst), 0);
        server.join();
    }

    #[test]
    fn test_serves_and_accepts_again() {
        let listener = ScriptedListener::new([
            vec![Chunk::Data(wire("{\"id\":1}"))],
            chunked(&wire("{\"id\":2}"), 3),
        ]);
        let (tx, rx) = mpsc::channel();

        let server = Server::spawn(listener, tx, fast_options()).unwrap();
        server.start(10011).unwrap();
        assert_eq!(server.port(), 10011);

        for expected in ["{\"id\":1}", "{\"id\":2}"] {
            assert!(matches!(next_event(&rx), DispatchEvent::Connected(None)));
            assert_eq!(expect_message(&rx).content(), expected);
            assert!(matches!(next_event(&rx), DispatchEvent::Disconnected));
        }

        // Still listening for further clients
        assert!(wait_until(|| server.state() == ServerState::WaitingForConnection));
        assert!(server.is_active());
        assert!(server.is_running());

        server.stop();
        assert!(wait_until(|| !server.is_running()));
        assert!(!server.is_active());
        server.join();
    }

    #[test]
    fn test_single_session_stops_after_disconnect() {
        let listener = ScriptedListener::new([
            vec![Chunk::Data(wire("{}"))],
            vec![Chunk::Data(wire("[]"))],
        ]);
        let (tx, rx) = mpsc::channel();
        let options = ServerOptions {
            single_session: true,
            ..fast_options()
        };

        let server = Server::spawn(listener, tx, options).unwrap();
        server.start(10011).unwrap();

        assert!(matches!(next_event(&rx), DispatchEvent::Connected(_)));
        assert_eq!(expect_message(&rx).content(), "{}");
        assert!(matches!(next_event(&rx), DispatchEvent::Disconnected));

        assert!(wait_until(|| !server.is_running()));
        assert!(!server.is_active());
        server.join();

        // The second client was never accepted
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
    }

    #[test]
    fn test_malformed_message_does_not_drop_connection() {
        let mut bytes = b"Content-Type: text/plain\r\n\r\n".to_vec();
        bytes.extend(wire("{\"ok\":true}"));
        let listener = ScriptedListener::new([vec![Chunk::Data(bytes)]]);
        let (tx, rx) = mpsc::channel();

        let server = Server::spawn(listener, tx, fast_options()).unwrap();
        server.start(10011).unwrap();

        assert!(matches!(next_event(&rx), DispatchEvent::Connected(_)));
        match next_event(&rx) {
            DispatchEvent::Error { error, fatal } => {
                assert!(!fatal);
                assert!(error.contains("Content-Length"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(expect_message(&rx).content(), "{\"ok\":true}");
        assert!(matches!(next_event(&rx), DispatchEvent::Disconnected));
    }

    #[test]
    fn test_truncated_message_reaches_dispatch() {
        let listener =
            ScriptedListener::new([vec![Chunk::data("Content-Length: 20\r\n\r\n{\"partial\":")]]);
        let (tx, rx) = mpsc::channel();

        let server = Server::spawn(listener, tx, fast_options()).unwrap();
        server.start(10011).unwrap();

        assert!(matches!(next_event(&rx), DispatchEvent::Connected(_)));
        match next_event(&rx) {
            DispatchEvent::Error { error, fatal } => {
                assert!(fatal);
                assert!(error.contains("mid-message"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert!(matches!(next_event(&rx), DispatchEvent::Disconnected));
        assert!(wait_until(|| server.state() == ServerState::WaitingForConnection));
    }

    #[test]
    fn test_accept_failures_back_off_then_serve() {
        let listener =
            ScriptedListener::new([vec![Chunk::Data(wire("{\"id\":7}"))]]).failing_accept(3);
        let (tx, rx) = mpsc::channel();

        let server = Server::spawn(listener, tx, fast_options()).unwrap();
        server.start(10011).unwrap();

        assert!(matches!(next_event(&rx), DispatchEvent::Connected(_)));
        assert_eq!(expect_message(&rx).content(), "{\"id\":7}");
        assert!(matches!(next_event(&rx), DispatchEvent::Disconnected));

        assert!(server.is_active());
        assert!(server.is_running());
        assert!(wait_until(|| server.state() == ServerState::WaitingForConnection));
    }

    #[test]
    fn test_stop_interrupts_listen_backoff() {
        let listener = ScriptedListener::idle().failing(usize::MAX);
        let listen_calls = Arc::clone(&listener.listen_calls);
        let (tx, _rx) = mpsc::channel();
        let options = ServerOptions {
            retry: RetryPolicy {
                listen_attempts: 0,
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(60),
            },
            ..fast_options()
        };

        let server = Server::spawn(listener, tx, options).unwrap();
        server.start(10011).unwrap();
        assert!(wait_until(|| listen_calls.load(Ordering::SeqCst) == 1));
        assert_eq!(server.state(), ServerState::Starting);

        let stopped_at = Instant::now();
        server.stop();
        assert!(wait_until(|| !server.is_running()));
        assert!(stopped_at.elapsed() < Duration::from_secs(5));
        assert_eq!(server.state(), ServerState::Stopping);
        assert_eq!(listen_calls.load(Ordering::SeqCst), 1);
        server.join();
    }

    #[test]
    fn test_accept_failures_escalate_past_threshold() {
        let (_tx, commands) = mpsc::channel();
        let mut control = Control {
            commands,
            shared: Arc::new(Shared {
                state: AtomicU8::new(ServerState::Idle as u8),
                active: AtomicBool::new(false),
                running: AtomicBool::new(true),
                port: AtomicU16::new(0),
            }),
            options: fast_options(),
            port: 0,
            listen_attempt: 0,
            accept_failures: 2,
        };
        assert!(!control.accept_failures_persistent());

        // Stays escalated for every failure past the threshold
        for failures in [3, 4, 50] {
            control.accept_failures = failures;
            assert!(control.accept_failures_persistent());
        }

        control.options.retry.listen_attempts = 0;
        control.accept_failures = ACCEPT_ERROR_THRESHOLD - 1;
        assert!(!control.accept_failures_persistent());
        control.accept_failures = ACCEPT_ERROR_THRESHOLD + 5;
        assert!(control.accept_failures_persistent());
    }

    #[test]
    fn test_listen_retries_then_succeeds() {
        let listener = ScriptedListener::idle().failing(2);
        let listen_calls = Arc::clone(&listener.listen_calls);
        let (tx, _rx) = mpsc::channel();

        let server = Server::spawn(listener, tx, fast_options()).unwrap();
        server.start(10011).unwrap();

        assert!(wait_until(|| server.is_active()));
        assert_eq!(listen_calls.load(Ordering::SeqCst), 3);
        assert!(server.is_running());
    }

    #[test]
    fn test_listen_gives_up() {
        let listener = ScriptedListener::idle().failing(usize::MAX);
        let listen_calls = Arc::clone(&listener.listen_calls);
        let (tx, _rx) = mpsc::channel();

        let server = Server::spawn(listener, tx, fast_options()).unwrap();
        server.start(10011).unwrap();

        assert!(wait_until(|| !server.is_running()));
        assert!(!server.is_active());
        assert_eq!(listen_calls.load(Ordering::SeqCst), 3);

        server.join();
    }

    #[test]
    fn test_start_on_new_port_relistens() {
        let listener = ScriptedListener::idle();
        let listen_calls = Arc::clone(&listener.listen_calls);
        let (tx, _rx) = mpsc::channel();

        let server = Server::spawn(listener, tx, fast_options()).unwrap();
        server.start(10011).unwrap();
        assert!(wait_until(|| server.is_active()));

        // Same port is a no-op
        server.start(10011).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(listen_calls.load(Ordering::SeqCst), 1);

        server.start(10012).unwrap();
        assert!(wait_until(|| listen_calls.load(Ordering::SeqCst) == 2));
        assert!(wait_until(|| server.is_active()));
        assert_eq!(server.port(), 10012);
    }

    #[test]
    fn test_commands_wake_the_transport() {
        let listener = ScriptedListener::idle();
        let notify = Arc::clone(&listener.notify);
        let (tx, _rx) = mpsc::channel();

        let server = Server::spawn(listener, tx, fast_options()).unwrap();
        server.start(10011).unwrap();
        server.stop();
        assert!(wait_until(|| !server.is_running()));
        assert_eq!(notify.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_start_after_worker_exit_fails() {
        let (tx, _rx) = mpsc::channel();
        let server = Server::spawn(ScriptedListener::idle(), tx, fast_options()).unwrap();
        server.stop();
        assert!(wait_until(|| !server.is_running()));
        // The worker drops its receiver on exit
        assert!(wait_until(|| matches!(
            server.start(10011),
            Err(ServerError::Stopped)
        )));
    }

    #[test]
    fn test_tcp_end_to_end() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let transport = TcpTransport::new("127.0.0.1", 16).unwrap();
        let (tx, rx) = mpsc::channel();
        let options = ServerOptions {
            poll_interval: Duration::from_secs(10),
            ..fast_options()
        };
        let server = Server::spawn(transport, tx, options).unwrap();
        server.start(port).unwrap();
        assert!(wait_until(|| server.is_active()));

        let mut client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut bytes = wire("{\"jsonrpc\":\"2.0\",\"method\":\"initialized\"}");
        bytes.extend(wire("{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"shutdown\"}"));
        client.write_all(&bytes[..7]).unwrap();
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(10));
        client.write_all(&bytes[7..]).unwrap();

        match next_event(&rx) {
            DispatchEvent::Connected(peer) => assert!(peer.is_some()),
            other => panic!("expected connect, got {:?}", other),
        }
        assert!(expect_message(&rx).content().contains("initialized"));
        assert!(expect_message(&rx).content().contains("shutdown"));
        assert_eq!(server.state(), ServerState::Serving);

        // A stop request interrupts the blocked read right away
        let stopped_at = Instant::now();
        server.stop();
        assert!(wait_until(|| !server.is_running()));
        assert!(stopped_at.elapsed() < Duration::from_secs(2));
        assert!(matches!(next_event(&rx), DispatchEvent::Disconnected));

        drop(client);
        server.join();
    }
}
