//! Outbound delivery: single sends and fan-out broadcasts.
//!
//! Sending never blocks the event loop. The formatted message is appended to
//! the recipient's outbound queue and written as far as the socket allows;
//! whatever is left is flushed on the next writable event. A recipient that
//! fails a write or lets its queue grow past `max_outbound_bytes` is evicted,
//! and a broadcast carries on with everyone else.

use crate::runtime::connection::{ConnectionId, ConnectionRegistry};
use crate::error::DisconnectReason;
use std::fmt;
use tracing::debug;

/// Formats messages and writes them to registry members.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    delimiter: String,
    max_outbound_bytes: usize,
}

impl Dispatcher {
    pub fn new(delimiter: &str, max_outbound_bytes: usize) -> Self {
        Self {
            delimiter: delimiter.to_string(),
            max_outbound_bytes,
        }
    }

    /// Render `message` followed by the delimiter.
    pub fn format(&self, message: impl fmt::Display) -> String {
        let mut out = message.to_string();
        out.push_str(&self.delimiter);
        out
    }

    /// Send one message to one connection.
    ///
    /// Returns `false` if the connection is unknown, already closing, or was
    /// evicted by this send.
    pub fn send(
        &self,
        registry: &mut ConnectionRegistry,
        to: ConnectionId,
        message: impl fmt::Display,
    ) -> bool {
        let wire = self.format(message);
        self.deliver(registry, to, wire.as_bytes())
    }

    /// Send to every open client except `from`.
    ///
    /// The listener is never a recipient. Returns how many recipients took
    /// the message.
    pub fn broadcast(
        &self,
        registry: &mut ConnectionRegistry,
        from: Option<ConnectionId>,
        message: impl fmt::Display,
    ) -> usize {
        let wire = self.format(message);
        let mut delivered = 0;

        for id in registry.ids() {
            if Some(id) == from {
                continue;
            }
            if self.deliver(registry, id, wire.as_bytes()) {
                delivered += 1;
            }
        }

        debug!(from = ?from, delivered, len = wire.len(), "Broadcast");
        delivered
    }

    fn deliver(&self, registry: &mut ConnectionRegistry, to: ConnectionId, wire: &[u8]) -> bool {
        let result = match registry.get_mut(to) {
            Some(conn) if conn.is_open() => conn.enqueue(wire, self.max_outbound_bytes),
            _ => return false,
        };

        match result {
            Ok(()) => true,
            Err(reason) => {
                evict(registry, to, reason);
                false
            }
        }
    }

    /// Drain a connection's outbound queue after a writable event.
    pub fn flush(&self, registry: &mut ConnectionRegistry, id: ConnectionId) {
        let result = match registry.get_mut(id) {
            Some(conn) if conn.is_open() => conn.flush(),
            _ => return,
        };

        if let Err(reason) = result {
            evict(registry, id, reason);
        }
    }
}

fn evict(registry: &mut ConnectionRegistry, id: ConnectionId, reason: DisconnectReason) {
    if registry.evict(id, reason) {
        debug!(conn = %id, %reason, "Send failed, evicting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::tests::{test_connection, test_listener};
    use std::io::Read;
    use std::net::{Shutdown, TcpStream as StdStream};
    use std::time::Duration;

    fn read_line(client: &mut StdStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        client.read_exact(&mut buf).unwrap();
        buf
    }

    fn assert_nothing_to_read(client: &mut StdStream) {
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; 1];
        let err = client.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ));
    }

    #[test]
    fn test_format_appends_delimiter() {
        let dispatcher = Dispatcher::new("\r\n", 1024);
        assert_eq!(dispatcher.format("hi"), "hi\r\n");
        assert_eq!(
            dispatcher.format(format_args!("{} + {} = {}", 1, 2, 3)),
            "1 + 2 = 3\r\n"
        );
    }

    #[test]
    fn test_send_to_one() {
        let dispatcher = Dispatcher::new("\r\n", 1024);
        let mut registry = ConnectionRegistry::new(test_listener());
        let (conn, mut client) = test_connection();
        let id = registry.add(conn);

        assert!(dispatcher.send(&mut registry, id, "olleh"));
        assert_eq!(read_line(&mut client, 7), b"olleh\r\n");
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let dispatcher = Dispatcher::new("\r\n", 1024);
        let mut registry = ConnectionRegistry::new(test_listener());
        let (a, mut client_a) = test_connection();
        let (b, mut client_b) = test_connection();
        let (c, mut client_c) = test_connection();
        let a = registry.add(a);
        registry.add(b);
        registry.add(c);

        let delivered = dispatcher.broadcast(&mut registry, Some(a), "hello");
        assert_eq!(delivered, 2);
        assert_eq!(read_line(&mut client_b, 7), b"hello\r\n");
        assert_eq!(read_line(&mut client_c, 7), b"hello\r\n");
        assert_nothing_to_read(&mut client_a);
    }

    #[test]
    fn test_broadcast_evicts_failed_recipient() {
        let dispatcher = Dispatcher::new("\r\n", 1024);
        let mut registry = ConnectionRegistry::new(test_listener());
        let (a, _client_a) = test_connection();
        let (b, mut client_b) = test_connection();
        let (c, _client_c) = test_connection();
        let a = registry.add(a);
        let b = registry.add(b);
        let c = registry.add(c);

        // Close C's socket underneath the registry
        registry.get(c).unwrap().stream.shutdown(Shutdown::Write).unwrap();

        let delivered = dispatcher.broadcast(&mut registry, Some(a), "hello");
        assert_eq!(delivered, 1);
        assert_eq!(read_line(&mut client_b, 7), b"hello\r\n");

        assert_eq!(registry.take_pending(), vec![c]);
        registry.remove(c);
        assert!(!registry.contains(c));
        assert!(registry.contains(b));
    }

    #[test]
    fn test_closing_connection_gets_nothing() {
        let dispatcher = Dispatcher::new("\r\n", 1024);
        let mut registry = ConnectionRegistry::new(test_listener());
        let (a, mut client_a) = test_connection();
        let a = registry.add(a);
        registry.evict(a, DisconnectReason::PeerClosed);

        assert!(!dispatcher.send(&mut registry, a, "late"));
        assert_eq!(dispatcher.broadcast(&mut registry, None, "late"), 0);
        assert_nothing_to_read(&mut client_a);
    }

    #[test]
    fn test_overflow_evicts() {
        let dispatcher = Dispatcher::new("\r\n", 8);
        let mut registry = ConnectionRegistry::new(test_listener());
        let (a, _client_a) = test_connection();
        let a = registry.add(a);

        assert!(!dispatcher.send(&mut registry, a, "much too long"));
        assert_eq!(
            registry.get(a).unwrap().state(),
            crate::runtime::ConnState::Closing(DisconnectReason::OutboundOverflow)
        );
    }
}
