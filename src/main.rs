//! linecast: a line-oriented TCP broadcast server
//!
//! Features:
//! - Single-threaded readiness loop (epoll on Linux, kqueue on macOS)
//! - Delimiter framing with a bounded accumulation buffer
//! - Non-blocking fan-out with per-client outbound queues
//! - Configuration via CLI arguments or TOML file

use linecast::handlers::{Relay, Reverse};
use linecast::{Config, Handler, HandlerKind, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        handler = ?config.handler,
        framing = ?config.framing,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Starting linecast server"
    );

    match config.handler {
        HandlerKind::Reverse => serve(config, Reverse),
        HandlerKind::Relay => serve(config, Relay),
    }
}

fn serve<H: Handler>(config: Config, handler: H) -> Result<(), Box<dyn std::error::Error>> {
    Server::bind(config, handler)?.run();
    Ok(())
}
