//! Connection records and the registry the event loop watches.
//!
//! Each connection tracks its lifecycle state (open or closing) and the
//! bytes still in flight in either direction. The registry owns every
//! connection plus the listening socket, which sits in front of the
//! clients as the sentinel member.

use crate::error::DisconnectReason;
use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use slab::Slab;
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Token reserved for the listening socket.
pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Identity of an accepted connection.
///
/// This is the socket's registration token with the poller; ids are
/// recycled once a connection has been removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(usize);

impl ConnectionId {
    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }

    pub(crate) fn from_token(token: Token) -> Self {
        ConnectionId(token.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Readable and writable; receives broadcasts.
    Open,
    /// Evicted during the current pass; removed once the pass completes.
    Closing(DisconnectReason),
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub(crate) stream: TcpStream,
    peer_addr: SocketAddr,
    idle_timeout: Duration,
    connected_at: DateTime<Utc>,
    state: ConnState,
    /// Bytes received but not yet framed.
    pub(crate) inbound: BytesMut,
    /// Bytes queued for the peer but not yet written.
    outbound: BytesMut,
    /// Last time either buffer moved forward.
    last_progress: Instant,
}

impl Connection {
    /// Create a new connection in the open state.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, idle_timeout: Duration) -> Self {
        Self {
            stream,
            peer_addr,
            idle_timeout,
            connected_at: Utc::now(),
            state: ConnState::Open,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            last_progress: Instant::now(),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ConnState::Open)
    }

    /// Mark connection for closing.
    ///
    /// Returns `false` if it was already closing; the first reason wins.
    pub fn close(&mut self, reason: DisconnectReason) -> bool {
        if self.is_open() {
            self.state = ConnState::Closing(reason);
            true
        } else {
            false
        }
    }

    /// Unflushed outbound bytes.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    pub(crate) fn touch(&mut self) {
        self.last_progress = Instant::now();
    }

    /// True when buffered bytes in either direction have sat untouched past
    /// the idle timeout. A connection with nothing in flight never stalls.
    pub fn is_stalled(&self, now: Instant) -> bool {
        let in_flight = !self.inbound.is_empty() || !self.outbound.is_empty();
        in_flight && now.duration_since(self.last_progress) >= self.idle_timeout
    }

    /// Queue bytes for the peer, then try to write them out.
    ///
    /// Fails with `OutboundOverflow` if the queue would exceed `limit`.
    pub(crate) fn enqueue(&mut self, bytes: &[u8], limit: usize) -> Result<(), DisconnectReason> {
        if self.outbound.len() + bytes.len() > limit {
            return Err(DisconnectReason::OutboundOverflow);
        }
        if self.outbound.is_empty() {
            self.touch();
        }
        self.outbound.extend_from_slice(bytes);
        self.flush()
    }

    /// Write as much of the outbound queue as the socket accepts.
    pub(crate) fn flush(&mut self) -> Result<(), DisconnectReason> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    return Err(DisconnectReason::Transport(io::ErrorKind::WriteZero));
                }
                Ok(n) => {
                    self.outbound.advance(n);
                    self.touch();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) => return Err(DisconnectReason::from(e)),
            }
        }
        Ok(())
    }
}

/// A registry member as reported by [`ConnectionRegistry::members`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    /// The listening socket.
    Listener,
    /// An accepted client.
    Client(ConnectionId),
}

/// Registry of live sockets.
///
/// Connections are stored in a slab (their index is their token) and an
/// order list keeps iteration in insertion order. Evictions during a pass
/// only mark the connection closing; [`take_pending`](Self::take_pending)
/// hands them over for removal once the pass is done.
pub struct ConnectionRegistry {
    listener: Option<TcpListener>,
    connections: Slab<Connection>,
    order: Vec<usize>,
    pending_removal: Vec<ConnectionId>,
}

impl ConnectionRegistry {
    /// Create a registry with the listening socket as its sentinel.
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener: Some(listener),
            connections: Slab::new(),
            order: Vec::new(),
            pending_removal: Vec::new(),
        }
    }

    pub fn listener(&self) -> Option<&TcpListener> {
        self.listener.as_ref()
    }

    /// Detach the listening socket. Returns `None` if already closed.
    pub fn close_listener(&mut self) -> Option<TcpListener> {
        self.listener.take()
    }

    /// Append a connection.
    pub fn add(&mut self, conn: Connection) -> ConnectionId {
        let id = self.connections.insert(conn);
        self.order.push(id);
        ConnectionId(id)
    }

    /// Delete a connection by identity.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.try_remove(id.0)?;
        self.order.retain(|&i| i != id.0);
        Some(conn)
    }

    /// Mark a connection closing and queue it for removal at pass end.
    ///
    /// Returns `false` if the connection is unknown or already closing.
    pub fn evict(&mut self, id: ConnectionId, reason: DisconnectReason) -> bool {
        let closed = self
            .connections
            .get_mut(id.0)
            .is_some_and(|conn| conn.close(reason));
        if closed {
            self.pending_removal.push(id);
        }
        closed
    }

    /// Connections evicted since the last call, in eviction order.
    pub fn take_pending(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.pending_removal)
    }

    /// Current members, listener first, then clients in insertion order.
    pub fn members(&self) -> Vec<Member> {
        let listener = self.listener.iter().map(|_| Member::Listener);
        let clients = self.order.iter().map(|&i| Member::Client(ConnectionId(i)));
        listener.chain(clients).collect()
    }

    /// Client ids in insertion order, closing ones included.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.order.iter().map(|&i| ConnectionId(i)).collect()
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id.0)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id.0)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains(id.0)
    }

    /// Number of members, the listener included while it is open.
    pub fn len(&self) -> usize {
        self.connections.len() + usize::from(self.listener.is_some())
    }

    /// Number of accepted clients.
    pub fn client_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over connections, closing ones included.
    pub fn iter(&self) -> impl Iterator<Item = (ConnectionId, &Connection)> {
        self.connections.iter().map(|(i, conn)| (ConnectionId(i), conn))
    }
}
