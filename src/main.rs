//! lsp-wire: serve Content-Length framed messages on a TCP port
//!
//! Accepts one client at a time, frames its messages, and logs them.
//! Runs until Ctrl-C, or until the worker stops on its own (listen retries
//! exhausted, or the session ended with `--single-session`).

use lsp_wire::config::Config;
use lsp_wire::runtime::TcpTransport;
use lsp_wire::{LogDispatch, Server};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How often the main thread checks whether the worker has stopped.
const STATUS_INTERVAL: Duration = Duration::from_millis(200);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        single_session = config.single_session,
        max_buffer_kb = config.max_buffer_size / 1024,
        "Starting lsp-wire server"
    );

    let transport = TcpTransport::new(config.host.clone(), config.backlog)?;
    let server = Server::spawn(transport, LogDispatch::default(), config.server_options())?;
    server.start(config.port)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(wait_for_shutdown(&server));

    server.stop();
    server.join();
    info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C or once the worker has stopped by itself.
async fn wait_for_shutdown(server: &Server) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut watch_signal = true;
    let mut status = tokio::time::interval(STATUS_INTERVAL);

    loop {
        tokio::select! {
            result = &mut ctrl_c, if watch_signal => match result {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                    watch_signal = false;
                }
            },
            _ = status.tick() => {
                if !server.is_running() {
                    info!("Server worker exited");
                    return;
                }
            }
        }
    }
}
