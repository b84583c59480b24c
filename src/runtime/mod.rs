//! Single-threaded readiness runtime.
//!
//! - `ConnectionRegistry`: the listening socket plus every accepted client
//! - `Framer`: delimiter framing of inbound bytes
//! - `Dispatcher`: non-blocking send and fan-out broadcast
//! - `EventLoop`: the mio poll cycle that drives all of the above
//!
//! Handlers plug in through the `Handler` trait and talk back to the server
//! through a `Context`.

mod connection;
mod control;
mod dispatch;
mod event_loop;
mod framer;
mod handler;

pub use connection::{ConnState, Connection, ConnectionId, ConnectionRegistry, Member};
pub use dispatch::Dispatcher;
pub use framer::{Framer, ReadResult, MAX_MESSAGES_PER_READ};
pub use handler::{Context, Handler};

pub(crate) use control::Control;
pub(crate) use event_loop::EventLoop;
