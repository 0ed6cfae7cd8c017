//! Configuration for the lsp-wire server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::buffer::DEFAULT_MAX_BUFFER_SIZE;
use crate::runtime::framer::DEFAULT_MAX_HEADER_SIZE;
use crate::runtime::tcp::DEFAULT_BACKLOG;
use crate::runtime::FrameLimits;
use crate::server::{RetryPolicy, ServerOptions};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "lsp-wire")]
#[command(version)]
#[command(about = "Content-Length framed message server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Stop after the first client disconnects
    #[arg(long)]
    pub single_session: bool,

    /// Maximum bytes buffered per connection
    #[arg(long)]
    pub max_buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and lifecycle configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Stop after the first client disconnects
    #[serde(default)]
    pub single_session: bool,
    /// Longest wait for an incoming connection, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Longest wait for bytes from a client, in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            single_session: false,
            poll_interval_ms: default_poll_interval_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

/// Message size bounds
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_header_size: default_max_header_size(),
            max_buffer_size: default_max_buffer_size(),
        }
    }
}

/// Listen/accept retry schedule
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    /// Listen attempts before giving up (0 = forever)
    #[serde(default = "default_listen_attempts")]
    pub listen_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            listen_attempts: default_listen_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    10011
}

fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_read_timeout_ms() -> u64 {
    250
}

fn default_max_header_size() -> usize {
    DEFAULT_MAX_HEADER_SIZE
}

fn default_max_buffer_size() -> usize {
    DEFAULT_MAX_BUFFER_SIZE
}

fn default_listen_attempts() -> u32 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub single_session: bool,
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    pub max_header_size: usize,
    pub max_buffer_size: usize,
    pub listen_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve parsed CLI args against the TOML file they name, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = match cli.config {
            Some(ref path) => {
                let contents = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
                toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
            }
            None => TomlConfig::default(),
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            framing,
            retry,
            logging,
        } = toml_config;

        let config = Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            backlog: server.backlog,
            single_session: cli.single_session || server.single_session,
            poll_interval: Duration::from_millis(server.poll_interval_ms),
            read_timeout: Duration::from_millis(server.read_timeout_ms),
            max_header_size: framing.max_header_size,
            max_buffer_size: cli.max_buffer_size.unwrap_or(framing.max_buffer_size),
            listen_attempts: retry.listen_attempts,
            initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(retry.max_backoff_ms),
            log_level: cli.log_level.unwrap_or(logging.level),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_header_size == 0 {
            return Err(ConfigError::Invalid(
                "framing.max_header_size must be non-zero".to_string(),
            ));
        }
        if self.max_buffer_size < self.max_header_size {
            return Err(ConfigError::Invalid(format!(
                "framing.max_buffer_size ({}) is smaller than framing.max_header_size ({})",
                self.max_buffer_size, self.max_header_size
            )));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "server.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker settings derived from this configuration.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            limits: FrameLimits {
                max_header_size: self.max_header_size,
                max_buffer_size: self.max_buffer_size,
                read_timeout: Some(self.read_timeout),
            },
            poll_interval: self.poll_interval,
            single_session: self.single_session,
            retry: RetryPolicy {
                listen_attempts: self.listen_attempts,
                initial_backoff: self.initial_backoff,
                max_backoff: self.max_backoff,
            },
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 10011);
        assert_eq!(config.server.poll_interval_ms, 50);
        assert!(!config.server.single_session);
        assert_eq!(config.framing.max_header_size, 8192);
        assert_eq!(config.framing.max_buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.retry.listen_attempts, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 6005
            single_session = true
            read_timeout_ms = 1000

            [framing]
            max_buffer_size = 65536

            [retry]
            listen_attempts = 0
            initial_backoff_ms = 10

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 6005);
        assert!(config.server.single_session);
        assert_eq!(config.server.read_timeout_ms, 1000);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.framing.max_buffer_size, 65536);
        assert_eq!(config.framing.max_header_size, 8192);
        assert_eq!(config.retry.listen_attempts, 0);
        assert_eq!(config.retry.initial_backoff_ms, 10);
        assert_eq!(config.retry.max_backoff_ms, 5000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_section_is_ignored() {
        let config: TomlConfig = toml::from_str("[metrics]\nenabled = true\n").unwrap();
        assert_eq!(config.server.port, 10011);
    }

    #[test]
    fn test_cli_takes_precedence() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 6005
            host = "0.0.0.0"

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let cli = CliArgs::parse_from([
            "lsp-wire",
            "--port",
            "7000",
            "--single-session",
            "--log-level",
            "trace",
        ]);

        let config = Config::merge(cli, toml_config).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.host, "0.0.0.0");
        assert!(config.single_session);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_server_options() {
        let cli = CliArgs::parse_from(["lsp-wire", "--max-buffer-size", "16384"]);
        let config = Config::merge(cli, TomlConfig::default()).unwrap();
        let options = config.server_options();

        assert_eq!(options.limits.max_buffer_size, 16384);
        assert_eq!(options.limits.max_header_size, 8192);
        assert_eq!(options.limits.read_timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.poll_interval, Duration::from_millis(50));
        assert_eq!(options.retry.initial_backoff, Duration::from_millis(100));
        assert_eq!(options.retry.max_backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_buffer_smaller_than_header_rejected() {
        let cli = CliArgs::parse_from(["lsp-wire", "--max-buffer-size", "100"]);
        let err = Config::merge(cli, TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/lsp-wire.toml")),
            ..CliArgs::default()
        };
        let err = Config::from_args(cli).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
        assert!(err.to_string().contains("lsp-wire.toml"));
    }
}
