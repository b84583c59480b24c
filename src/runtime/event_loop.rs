//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking accept/read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread owns the loop and everything it touches. Each cycle takes a
//! snapshot of the readiness report, handles it in report order, then
//! applies the evictions the pass produced. Sockets whose read budget ran
//! out are carried into the next cycle, which then polls without waiting. Nothing a single connection does
//! can stop the loop; only [`Control::request_stop`] does.

use crate::config::Config;
use crate::error::{DisconnectReason, Error, Result};
use crate::event::{EventEncoder, LifecycleEvent};
use crate::runtime::connection::{
    ConnState, Connection, ConnectionId, ConnectionRegistry, LISTENER_TOKEN,
};
use crate::runtime::control::{Control, WAKER_TOKEN};
use crate::runtime::dispatch::Dispatcher;
use crate::runtime::framer::Framer;
use crate::runtime::handler::{Context, Handler};
use chrono::Utc;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const EVENTS_CAPACITY: usize = 1024;

/// Readiness observed for one token in one poll round.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
}

pub(crate) struct EventLoop<H> {
    poll: Poll,
    events: Events,
    registry: ConnectionRegistry,
    /// Connections with unread input left over from the last pass.
    carried: Vec<ConnectionId>,
    framer: Framer,
    dispatcher: Dispatcher,
    encoder: Box<dyn EventEncoder>,
    handler: H,
    control: Arc<Control>,
    local_addr: SocketAddr,
    poll_timeout: Duration,
    idle_timeout: Duration,
}

impl<H: Handler> EventLoop<H> {
    /// Bind the listening socket and register it as the sentinel member.
    ///
    /// This is the only fallible step of a server's life.
    pub(crate) fn bind(config: &Config, handler: H, encoder: Box<dyn EventEncoder>) -> Result<Self> {
        config.validate()?;
        let addr = config.socket_addr()?;

        let framer = Framer::new(
            &config.delimiter,
            config.framing,
            config.chunk_size,
            config.max_frame_bytes,
        )?;

        let poll = Poll::new()?;
        let control = Arc::new(Control::new(poll.registry())?);

        let listener = create_listener(addr, config.backlog)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        let registry = ConnectionRegistry::new(listener);
        control.set_members(registry.len());

        info!(
            addr = %local_addr,
            backlog = config.backlog,
            framing = ?config.framing,
            chunk_size = config.chunk_size,
            "Listening"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            registry,
            carried: Vec::new(),
            framer,
            dispatcher: Dispatcher::new(&config.delimiter, config.max_outbound_bytes),
            encoder,
            handler,
            control,
            local_addr,
            poll_timeout: config.poll_timeout,
            idle_timeout: config.idle_timeout,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn control(&self) -> &Arc<Control> {
        &self.control
    }

    /// Run until stopped.
    pub(crate) fn run(mut self) {
        info!(addr = %self.local_addr, "Dispatch loop running");

        while self.control.is_running() {
            let timeout = if self.carried.is_empty() {
                self.poll_timeout
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!(error = %e, "Readiness wait failed, retrying");
                }
                continue;
            }

            if !self.control.is_running() {
                break;
            }

            let mut ready: Vec<Readiness> = self
                .events
                .iter()
                .map(|event| Readiness {
                    token: event.token(),
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable(),
                })
                .collect();

            for id in std::mem::take(&mut self.carried) {
                let token = id.token();
                match ready.iter_mut().find(|item| item.token == token) {
                    Some(item) => item.readable = true,
                    None => ready.push(Readiness {
                        token,
                        readable: true,
                        writable: false,
                    }),
                }
            }

            for item in ready {
                self.dispatch(item);
            }

            self.evict_stalled(Instant::now());
            self.reap();
            self.control.set_members(self.registry.len());
        }

        self.shutdown();
    }

    fn dispatch(&mut self, item: Readiness) {
        match item.token {
            WAKER_TOKEN => {}
            LISTENER_TOKEN => {
                if item.readable {
                    self.accept_connections();
                }
            }
            token => {
                let id = ConnectionId::from_token(token);
                if item.writable {
                    self.dispatcher.flush(&mut self.registry, id);
                }
                if item.readable {
                    self.handle_readable(id);
                }
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            let accepted = match self.registry.listener() {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.add_connection(stream, peer_addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // The failure belongs to one pending connection; keep draining
                Err(ref e) if is_per_connection(e.kind()) => {
                    debug!(error = %e, "Pending connection failed before accept");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn add_connection(&mut self, stream: mio::net::TcpStream, peer_addr: SocketAddr) {
        let id = self
            .registry
            .add(Connection::new(stream, peer_addr, self.idle_timeout));

        let registered = match self.registry.get_mut(id) {
            Some(conn) => self.poll.registry().register(
                &mut conn.stream,
                id.token(),
                Interest::READABLE | Interest::WRITABLE,
            ),
            None => return,
        };
        if let Err(e) = registered {
            warn!(peer = %peer_addr, error = %e, "Failed to register connection");
            self.registry.remove(id);
            return;
        }

        info!(conn = %id, peer = %peer_addr, "{peer_addr} now online");

        match self.encoder.encode(&LifecycleEvent::connected(peer_addr)) {
            Ok(announcement) => {
                self.dispatcher
                    .broadcast(&mut self.registry, Some(id), announcement);
            }
            Err(e) => warn!(error = %e, "Failed to encode connected event"),
        }

        let mut ctx = Context::new(&mut self.registry, &self.dispatcher, &self.control);
        self.handler.on_connect(&mut ctx, id);
    }

    fn handle_readable(&mut self, id: ConnectionId) {
        let (result, peer_addr) = match self.registry.get_mut(id) {
            Some(conn) if conn.is_open() => {
                let result = self.framer.read_from(&mut conn.stream, &mut conn.inbound);
                if result.bytes_read > 0 {
                    conn.touch();
                }
                (result, conn.peer_addr())
            }
            _ => return,
        };

        for message in &result.messages {
            if message.is_empty() {
                trace!(conn = %id, "Empty message ignored");
                continue;
            }
            // A handler may have evicted the sender
            if !self.registry.get(id).is_some_and(|c| c.is_open()) {
                break;
            }

            debug!(conn = %id, peer = %peer_addr, len = message.len(), "{message}");
            let mut ctx = Context::new(&mut self.registry, &self.dispatcher, &self.control);
            self.handler.on_message(&mut ctx, id, message);
        }

        if let Some(reason) = result.disconnect {
            self.registry.evict(id, reason);
        } else if result.more {
            self.carried.push(id);
        }
    }

    /// Evict connections whose in-flight bytes stopped moving.
    fn evict_stalled(&mut self, now: Instant) {
        let stalled: Vec<ConnectionId> = self
            .registry
            .iter()
            .filter(|(_, conn)| conn.is_open() && conn.is_stalled(now))
            .map(|(id, _)| id)
            .collect();

        for id in stalled {
            self.registry.evict(id, DisconnectReason::IdleTimeout);
        }
    }

    /// Remove everything evicted during the pass.
    ///
    /// `on_disconnect` callbacks may evict further connections, so this
    /// repeats until nothing is pending.
    fn reap(&mut self) {
        loop {
            let pending = self.registry.take_pending();
            if pending.is_empty() {
                return;
            }

            for id in pending {
                let reason = match self.registry.get(id).map(|c| c.state()) {
                    Some(ConnState::Closing(reason)) => reason,
                    _ => continue,
                };

                let mut ctx = Context::new(&mut self.registry, &self.dispatcher, &self.control);
                self.handler.on_disconnect(&mut ctx, id, reason);

                if let Some(mut conn) = self.registry.remove(id) {
                    let _ = self.poll.registry().deregister(&mut conn.stream);
                    let session = Utc::now() - conn.connected_at();
                    if reason.is_peer_closed() {
                        info!(
                            conn = %id,
                            peer = %conn.peer_addr(),
                            session_secs = session.num_seconds(),
                            "{} went offline",
                            conn.peer_addr()
                        );
                    } else {
                        info!(
                            conn = %id,
                            peer = %conn.peer_addr(),
                            %reason,
                            session_secs = session.num_seconds(),
                            "Connection evicted"
                        );
                    }
                }
            }
        }
    }

    /// Close the listener. Clients are not drained or notified.
    fn shutdown(&mut self) {
        if let Some(mut listener) = self.registry.close_listener() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        self.control.set_members(self.registry.len());
        info!(
            addr = %self.local_addr,
            abandoned = self.registry.client_count(),
            "Dispatch loop stopped"
        );
    }
}

/// Accept errors that only concern the connection being accepted.
fn is_per_connection(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::PermissionDenied
    )
}

/// Create a TCP listener with SO_REUSEADDR and the configured backlog.
fn create_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| Error::Io(io::Error::new(e.kind(), format!("bind {addr}: {e}"))))?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FramingMode;
    use crate::event::JsonEncoder;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::net::TcpStream as StdStream;
    use std::sync::mpsc;
    use std::thread;

    fn test_config() -> Config {
        let mut config = Config::new("127.0.0.1", 0);
        config.poll_timeout = Duration::from_millis(100);
        config
    }

    fn echo_loop() -> EventLoop<impl Handler> {
        let handler = |ctx: &mut Context<'_>, conn: ConnectionId, message: &str| {
            ctx.send(conn, message);
        };
        EventLoop::bind(&test_config(), handler, Box::new(JsonEncoder)).unwrap()
    }

    #[test]
    fn test_bind_registers_listener() {
        let event_loop = echo_loop();
        assert_ne!(event_loop.local_addr().port(), 0);
        assert_eq!(event_loop.registry.len(), 1);
        assert_eq!(event_loop.control().members(), 1);
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Config::new("127.0.0.1", port);
        let handler = |_: &mut Context<'_>, _: ConnectionId, _: &str| {};
        let result = EventLoop::bind(&config, handler, Box::new(JsonEncoder));
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let mut config = test_config();
        config.chunk_size = 0;
        let handler = |_: &mut Context<'_>, _: ConnectionId, _: &str| {};
        let result = EventLoop::bind(&config, handler, Box::new(JsonEncoder));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_echo_and_stop() {
        let event_loop = echo_loop();
        let addr = event_loop.local_addr();
        let control = Arc::clone(event_loop.control());
        let (done_tx, done_rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            event_loop.run();
            done_tx.send(()).unwrap();
        });

        let mut client = StdStream::connect(addr).unwrap();
        client.write_all(b"ping\r\n").unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping\r\n");

        assert!(control.request_stop());
        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("loop did not stop");
        worker.join().unwrap();
        assert_eq!(control.members(), 1);
    }

    #[test]
    fn test_per_connection_accept_errors_keep_draining() {
        assert!(is_per_connection(io::ErrorKind::ConnectionAborted));
        assert!(is_per_connection(io::ErrorKind::ConnectionReset));
        assert!(is_per_connection(io::ErrorKind::Interrupted));
        assert!(!is_per_connection(io::ErrorKind::OutOfMemory));
        assert!(!is_per_connection(io::ErrorKind::Other));
    }

    #[test]
    fn test_flooding_client_does_not_starve_others() {
        let mut config = test_config();
        config.framing = FramingMode::Split;
        config.chunk_size = 64;
        config.max_frame_bytes = 64;
        let handler = |ctx: &mut Context<'_>, conn: ConnectionId, message: &str| {
            if message == "ping" {
                ctx.send(conn, "pong");
            }
        };
        let event_loop = EventLoop::bind(&config, handler, Box::new(JsonEncoder)).unwrap();
        let addr = event_loop.local_addr();
        let control = Arc::clone(event_loop.control());
        let worker = thread::spawn(move || event_loop.run());

        let stop = Arc::new(AtomicBool::new(false));
        let mut flooder = StdStream::connect(addr).unwrap();
        flooder
            .set_write_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let flooding = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let lines = b"x\r\n".repeat(4096);
                while !stop.load(Ordering::Relaxed) {
                    if flooder.write_all(&lines).is_err() {
                        break;
                    }
                }
            })
        };

        let mut client = StdStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"ping\r\n").unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong\r\n");

        stop.store(true, Ordering::Relaxed);
        control.request_stop();
        worker.join().unwrap();
        flooding.join().unwrap();
    }

    #[test]
    fn test_idle_partial_frame_is_evicted() {
        let mut config = test_config();
        config.idle_timeout = Duration::from_millis(50);
        let handler = |_: &mut Context<'_>, _: ConnectionId, _: &str| {};
        let event_loop = EventLoop::bind(&config, handler, Box::new(JsonEncoder)).unwrap();
        let addr = event_loop.local_addr();
        let control = Arc::clone(event_loop.control());
        let worker = thread::spawn(move || event_loop.run());

        let mut client = StdStream::connect(addr).unwrap();
        client.write_all(b"no delimiter yet").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();

        // Server drops us: read sees EOF (or a reset)
        let mut buf = [0u8; 16];
        match client.read(&mut buf) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
        }

        control.request_stop();
        worker.join().unwrap();
    }
}
