//! Line reversal handler.
//!
//! ```text
//! Request:  hello\r\n
//! Response: olleh\r\n
//! ```

use crate::runtime::{ConnectionId, Context, Handler};

#[derive(Debug, Default, Clone, Copy)]
pub struct Reverse;

impl Handler for Reverse {
    fn on_message(&mut self, ctx: &mut Context<'_>, conn: ConnectionId, message: &str) {
        ctx.send(conn, reverse(message));
    }
}

/// Reverse by Unicode scalar value.
pub fn reverse(message: &str) -> String {
    message.chars().rev().collect()
}
