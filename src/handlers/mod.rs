//! Built-in message handlers.
//!
//! - `reverse`: replies to the sender with the message reversed
//! - `relay`: forwards every message to all other clients

pub mod relay;
pub mod reverse;

pub use relay::Relay;
pub use reverse::Reverse;
