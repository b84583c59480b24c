//! linecast: a line-oriented TCP broadcast server.
//!
//! One thread multiplexes readiness across the listening socket and every
//! client, frames inbound bytes into delimiter-terminated messages, and hands
//! each message to a pluggable [`Handler`]. Handlers reply to one client or
//! fan a message out to all the others.
//!
//! ```no_run
//! use linecast::{Config, ConnectionId, Context, Server};
//!
//! let handler = |ctx: &mut Context<'_>, conn: ConnectionId, message: &str| {
//!     ctx.broadcast(conn, message);
//! };
//! let running = Server::bind(Config::new("127.0.0.1", 10301), handler)?
//!     .start()?;
//! // ...
//! running.quit_and_join().ok();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod handlers;
pub mod runtime;
pub mod server;

pub use config::{Config, FramingMode, HandlerKind};
pub use error::{DisconnectReason, Error, Result};
pub use event::{EventEncoder, JsonEncoder, LifecycleEvent};
pub use runtime::{ConnectionId, Context, Handler};
pub use server::{Running, Server, ServerHandle};
