//! Server lifecycle: bind, run in the foreground or on a background thread,
//! and stop from anywhere.

use crate::config::Config;
use crate::error::Result;
use crate::event::{EventEncoder, JsonEncoder};
use crate::runtime::{Control, EventLoop, Handler};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::info;

/// A bound server that has not started polling yet.
pub struct Server<H> {
    event_loop: EventLoop<H>,
}

impl<H: Handler> Server<H> {
    /// Bind the listening socket with the default JSON event encoder.
    ///
    /// Fails if the address cannot be resolved or bound; nothing after this
    /// point is fatal.
    pub fn bind(config: Config, handler: H) -> Result<Self> {
        Self::bind_with_encoder(config, handler, JsonEncoder)
    }

    /// Bind with a custom encoder for lifecycle announcements.
    pub fn bind_with_encoder(
        config: Config,
        handler: H,
        encoder: impl EventEncoder,
    ) -> Result<Self> {
        let event_loop = EventLoop::bind(&config, handler, Box::new(encoder))?;
        Ok(Self { event_loop })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.event_loop.local_addr()
    }

    /// Handle for stopping the server from another thread.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            control: Arc::clone(self.event_loop.control()),
        }
    }

    /// Run the dispatch loop on the current thread until stopped.
    pub fn run(self) {
        self.event_loop.run();
    }

    /// Run the dispatch loop on a dedicated thread.
    pub fn start(self) -> io::Result<Running> {
        let handle = self.handle();
        let local_addr = self.local_addr();
        let thread = thread::Builder::new()
            .name("dispatch".to_string())
            .spawn(move || self.run())?;

        info!(addr = %local_addr, "Server started");
        Ok(Running {
            handle,
            local_addr,
            thread,
        })
    }
}

/// Cross-thread handle to a server.
///
/// Cheap to clone; every clone controls the same server.
#[derive(Clone)]
pub struct ServerHandle {
    control: Arc<Control>,
}

impl ServerHandle {
    /// Stop the dispatch loop and close the listening socket.
    ///
    /// Safe to call from any thread, any number of times. The loop wakes
    /// immediately; open clients are abandoned, not drained.
    pub fn quit(&self) {
        if self.control.request_stop() {
            info!("Quit requested");
        }
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Registry size as of the end of the last poll cycle, listener included.
    pub fn connection_count(&self) -> usize {
        self.control.members()
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("running", &self.is_running())
            .field("members", &self.connection_count())
            .finish()
    }
}

/// A server running on its background thread.
#[derive(Debug)]
pub struct Running {
    handle: ServerHandle,
    local_addr: SocketAddr,
    thread: JoinHandle<()>,
}

impl Running {
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the loop thread to finish.
    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }

    /// Stop the server and wait for the loop thread.
    pub fn quit_and_join(self) -> thread::Result<()> {
        self.handle.quit();
        self.join()
    }
}
