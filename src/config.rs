//! Configuration module for the linecast server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::{ConfigError, Error};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// How the framer turns accumulated bytes into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    /// Everything received up to and including the first delimiter-bearing
    /// read is one message, delimiter characters stripped from both ends.
    #[default]
    Coalesce,
    /// Every delimiter-terminated segment is its own message; the unterminated
    /// tail is kept for the next round.
    Split,
}

/// Built-in message handlers selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// Reply to the sender with the message reversed.
    #[default]
    Reverse,
    /// Broadcast every message to all other clients.
    Relay,
}

/// Command-line arguments for the broadcast server
#[derive(Parser, Debug)]
#[command(name = "linecast")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP broadcast server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:10301)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Message delimiter; `\r`, `\n`, `\t` and `\\` escapes are understood
    #[arg(short = 'd', long)]
    pub delimiter: Option<String>,

    /// Bytes requested per socket read
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Seconds a stalled partial frame or unflushed reply may sit before eviction
    #[arg(short = 't', long)]
    pub idle_timeout: Option<u64>,

    /// Framing policy for messages that arrive together
    #[arg(long, value_enum)]
    pub framing: Option<FramingMode>,

    /// Message handler to run
    #[arg(long, value_enum)]
    pub handler: Option<HandlerKind>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Upper bound on one readiness wait, in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    /// Per-connection idle timeout, in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Handler to run
    #[serde(default)]
    pub handler: HandlerKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            poll_timeout_secs: default_poll_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            handler: HandlerKind::default(),
        }
    }
}

/// Framing-related configuration
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Ceiling on bytes buffered while waiting for a delimiter
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub mode: FramingMode,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            chunk_size: default_chunk_size(),
            max_frame_bytes: default_max_frame_bytes(),
            mode: FramingMode::default(),
        }
    }
}

/// Outbound dispatch configuration
#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    /// Ceiling on unflushed bytes queued for one recipient
    #[serde(default = "default_max_outbound_bytes")]
    pub max_outbound_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_outbound_bytes: default_max_outbound_bytes(),
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

fn default_listen() -> String {
    "127.0.0.1:10301".to_string()
}

fn default_backlog() -> i32 {
    5
}

fn default_poll_timeout() -> u64 {
    5
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_delimiter() -> String {
    "\r\n".to_string()
}

fn default_chunk_size() -> usize {
    4096
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024 // 1 MB
}

fn default_max_outbound_bytes() -> usize {
    1024 * 1024 // 1 MB
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
    pub delimiter: String,
    pub chunk_size: usize,
    pub idle_timeout: Duration,
    pub poll_timeout: Duration,
    pub max_frame_bytes: usize,
    pub max_outbound_bytes: usize,
    pub framing: FramingMode,
    pub handler: HandlerKind,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 10301,
            backlog: default_backlog(),
            delimiter: default_delimiter(),
            chunk_size: default_chunk_size(),
            idle_timeout: Duration::from_secs(default_idle_timeout()),
            poll_timeout: Duration::from_secs(default_poll_timeout()),
            max_frame_bytes: default_max_frame_bytes(),
            max_outbound_bytes: default_max_outbound_bytes(),
            framing: FramingMode::default(),
            handler: HandlerKind::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Configuration with every default except the bind address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Config {
            host: host.into(),
            port,
            ..Config::default()
        }
    }

    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, Error> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        let mut config = Config::from_toml(toml_config)?;

        // Merge CLI args (CLI takes precedence)
        if let Some(listen) = cli.listen {
            let (host, port) = split_listen(&listen)?;
            config.host = host;
            config.port = port;
        }
        if let Some(delimiter) = cli.delimiter {
            config.delimiter = unescape_delimiter(&delimiter);
        }
        if let Some(chunk_size) = cli.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(secs) = cli.idle_timeout {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(framing) = cli.framing {
            config.framing = framing;
        }
        if let Some(handler) = cli.handler {
            config.handler = handler;
        }
        if cli.log_level != "info" {
            config.log_level = cli.log_level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Resolve a parsed TOML file into a configuration.
    pub fn from_toml(toml: TomlConfig) -> Result<Self, Error> {
        let (host, port) = split_listen(&toml.server.listen)?;
        Ok(Config {
            host,
            port,
            backlog: toml.server.backlog,
            delimiter: toml.framing.delimiter,
            chunk_size: toml.framing.chunk_size,
            idle_timeout: Duration::from_secs(toml.server.idle_timeout_secs),
            poll_timeout: Duration::from_secs(toml.server.poll_timeout_secs),
            max_frame_bytes: toml.framing.max_frame_bytes,
            max_outbound_bytes: toml.dispatch.max_outbound_bytes,
            framing: toml.framing.mode,
            handler: toml.server.handler,
            log_level: toml.logging.level,
        })
    }

    /// Reject combinations the event loop cannot work with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.delimiter.is_empty() {
            return Err(Error::InvalidConfig("delimiter must not be empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be positive".into()));
        }
        if self.max_frame_bytes < self.chunk_size {
            return Err(Error::InvalidConfig(format!(
                "max_frame_bytes ({}) is smaller than chunk_size ({})",
                self.max_frame_bytes, self.chunk_size
            )));
        }
        if self.poll_timeout.is_zero() {
            return Err(Error::InvalidConfig("poll_timeout must be positive".into()));
        }
        Ok(())
    }

    /// Resolve `host:port` to the first matching socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, Error> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| Error::AddrParse(format!("{}:{}", self.host, self.port)))?
            .next()
            .ok_or_else(|| Error::AddrParse(format!("{}:{}", self.host, self.port)))
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn split_listen(listen: &str) -> Result<(String, u16), Error> {
    let (host, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| Error::AddrParse(listen.to_string()))?;
    let port = port
        .parse()
        .map_err(|_| Error::AddrParse(listen.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

/// Expand the backslash escapes a shell makes awkward to type.
fn unescape_delimiter(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 10301);
        assert_eq!(config.backlog, 5);
        assert_eq!(config.delimiter, "\r\n");
        assert_eq!(config.chunk_size, 4096);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.poll_timeout, Duration::from_secs(5));
        assert_eq!(config.framing, FramingMode::Coalesce);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            backlog = 64
            idle_timeout_secs = 30
            handler = "relay"

            [framing]
            delimiter = "\n"
            chunk_size = 512
            mode = "split"

            [dispatch]
            max_outbound_bytes = 65536

            [logging]
            level = "debug"
        "#;

        let toml: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.backlog, 64);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.handler, HandlerKind::Relay);
        assert_eq!(config.delimiter, "\n");
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.framing, FramingMode::Split);
        assert_eq!(config.max_outbound_bytes, 65536);
        assert_eq!(config.max_frame_bytes, 1024 * 1024);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::new("127.0.0.1", 0);
        config.delimiter.clear();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::new("127.0.0.1", 0);
        config.max_frame_bytes = config.chunk_size - 1;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_split_listen() {
        assert_eq!(
            split_listen("127.0.0.1:11211").unwrap(),
            ("127.0.0.1".to_string(), 11211)
        );
        assert_eq!(split_listen("[::1]:80").unwrap(), ("::1".to_string(), 80));
        assert!(split_listen("no-port").is_err());
        assert!(split_listen("host:notaport").is_err());
    }

    #[test]
    fn test_unescape_delimiter() {
        assert_eq!(unescape_delimiter("\\r\\n"), "\r\n");
        assert_eq!(unescape_delimiter(";"), ";");
        assert_eq!(unescape_delimiter("\\x"), "\\x");
    }

    #[test]
    fn test_socket_addr() {
        let config = Config::new("127.0.0.1", 4000);
        assert_eq!(
            config.socket_addr().unwrap(),
            "127.0.0.1:4000".parse::<SocketAddr>().unwrap()
        );
    }
}
