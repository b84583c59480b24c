//! Relay handler: every message goes to every other client, verbatim.

use crate::runtime::{ConnectionId, Context, Handler};
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct Relay;

impl Handler for Relay {
    fn on_message(&mut self, ctx: &mut Context<'_>, conn: ConnectionId, message: &str) {
        let delivered = ctx.broadcast(conn, message);
        debug!(conn = %conn, delivered, "Relayed");
    }
}
