//! Message handler extension point.
//!
//! Handlers run synchronously on the event loop thread. They see the server
//! through a [`Context`], which lets them reply, broadcast, and inspect the
//! registry for the duration of one callback.

use crate::error::DisconnectReason;
use crate::runtime::connection::{ConnectionId, ConnectionRegistry};
use crate::runtime::control::Control;
use crate::runtime::dispatch::Dispatcher;
use std::fmt;
use std::net::SocketAddr;

/// Callbacks invoked by the event loop.
///
/// Only `on_message` is required. Handlers must not block: every other
/// connection waits while a callback runs.
pub trait Handler: Send + 'static {
    /// A complete, non-empty message arrived on `conn`.
    fn on_message(&mut self, ctx: &mut Context<'_>, conn: ConnectionId, message: &str);

    /// `conn` was accepted and the "connected" event has been broadcast.
    fn on_connect(&mut self, _ctx: &mut Context<'_>, _conn: ConnectionId) {}

    /// `conn` is about to be removed from the registry.
    fn on_disconnect(
        &mut self,
        _ctx: &mut Context<'_>,
        _conn: ConnectionId,
        _reason: DisconnectReason,
    ) {
    }
}

impl<F> Handler for F
where
    F: FnMut(&mut Context<'_>, ConnectionId, &str) + Send + 'static,
{
    fn on_message(&mut self, ctx: &mut Context<'_>, conn: ConnectionId, message: &str) {
        self(ctx, conn, message)
    }
}

/// The server as seen from inside a handler callback.
pub struct Context<'a> {
    registry: &'a mut ConnectionRegistry,
    dispatcher: &'a Dispatcher,
    control: &'a Control,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        registry: &'a mut ConnectionRegistry,
        dispatcher: &'a Dispatcher,
        control: &'a Control,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            control,
        }
    }

    /// Send `message` plus the delimiter to `conn`.
    ///
    /// Accepts anything displayable, so `format_args!` works for templated
    /// replies. Returns `false` if `conn` is gone or was evicted by this send.
    pub fn send(&mut self, conn: ConnectionId, message: impl fmt::Display) -> bool {
        self.dispatcher.send(self.registry, conn, message)
    }

    /// Send `message` to every client except `from`.
    pub fn broadcast(&mut self, from: ConnectionId, message: impl fmt::Display) -> usize {
        self.dispatcher.broadcast(self.registry, Some(from), message)
    }

    /// Send `message` to every client.
    pub fn broadcast_all(&mut self, message: impl fmt::Display) -> usize {
        self.dispatcher.broadcast(self.registry, None, message)
    }

    pub fn peer_addr(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.registry.get(conn).map(|c| c.peer_addr())
    }

    /// Clients that are still open, in acceptance order.
    pub fn connections(&self) -> Vec<ConnectionId> {
        self.registry
            .ids()
            .into_iter()
            .filter(|&id| self.registry.get(id).is_some_and(|c| c.is_open()))
            .collect()
    }

    /// Registry size, the listener included.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Drop `conn` once the current pass completes.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        self.registry.evict(conn, DisconnectReason::Requested);
    }

    /// Ask the event loop to stop after the current pass.
    pub fn quit(&self) {
        self.control.request_stop();
    }
}
