//! Error types for linecast.
//!
//! `Error` is what the public API surfaces (startup only). `DisconnectReason`
//! never leaves the event loop: it is logged and handed to
//! `Handler::on_disconnect`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the server API.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket setup failed (bind, listen, poll creation).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `host:port` did not parse as a socket address.
    #[error("invalid listen address '{0}'")]
    AddrParse(String),

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Why a connection was evicted from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DisconnectReason {
    /// Peer closed its end (zero-length read).
    #[error("peer closed connection")]
    PeerClosed,

    /// Read or write failed.
    #[error("transport error: {0}")]
    Transport(io::ErrorKind),

    /// Pending inbound or outbound bytes made no progress within the idle timeout.
    #[error("idle timeout")]
    IdleTimeout,

    /// Inbound frame grew past the configured ceiling without a delimiter.
    #[error("frame exceeds maximum length")]
    FrameTooLarge,

    /// Framed bytes were not valid UTF-8.
    #[error("message is not valid UTF-8")]
    InvalidUtf8,

    /// Recipient fell too far behind; its outbound buffer overflowed.
    #[error("outbound buffer overflow")]
    OutboundOverflow,

    /// A handler asked for the connection to be dropped.
    #[error("closed by handler")]
    Requested,
}

impl DisconnectReason {
    /// True for evictions the peer initiated in an orderly way.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, DisconnectReason::PeerClosed)
    }
}

impl From<&io::Error> for DisconnectReason {
    fn from(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => DisconnectReason::IdleTimeout,
            kind => DisconnectReason::Transport(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_from_io() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(
            DisconnectReason::from(&reset),
            DisconnectReason::Transport(io::ErrorKind::ConnectionReset)
        );

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(DisconnectReason::from(&timeout), DisconnectReason::IdleTimeout);
    }

    #[test]
    fn test_error_display() {
        let err = Error::AddrParse("nope".to_string());
        assert_eq!(err.to_string(), "invalid listen address 'nope'");
        assert!(DisconnectReason::PeerClosed.is_peer_closed());
        assert!(!DisconnectReason::FrameTooLarge.is_peer_closed());
    }
}
