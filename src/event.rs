//! Lifecycle events broadcast by the server itself.
//!
//! Today there is one: `connected`, announced to existing clients when a new
//! peer is accepted. The wire encoding belongs to an [`EventEncoder`]; the
//! only requirement is that it yields a single string without the delimiter.

use serde::Serialize;
use std::net::SocketAddr;

/// Error produced by an encoder.
pub type EncodeError = Box<dyn std::error::Error + Send + Sync>;

/// A named server event with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub name: String,
    /// Peer address as `(host, port)`.
    pub data: (String, u16),
}

impl LifecycleEvent {
    pub fn connected(peer: SocketAddr) -> Self {
        Self {
            name: "connected".to_string(),
            data: (peer.ip().to_string(), peer.port()),
        }
    }
}

/// Turns lifecycle events into broadcastable text.
pub trait EventEncoder: Send + 'static {
    fn encode(&self, event: &LifecycleEvent) -> Result<String, EncodeError>;
}

/// Compact JSON: `{"name":"connected","data":["127.0.0.1",54321]}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl EventEncoder for JsonEncoder {
    fn encode(&self, event: &LifecycleEvent) -> Result<String, EncodeError> {
        Ok(serde_json::to_string(event)?)
    }
}
