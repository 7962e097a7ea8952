//! Event-driven connection engine.
//!
//! One reactor thread multiplexes every connection over a single readiness
//! backend (mio on epoll/kqueue, or poll(2)):
//! - `selector`: readiness multiplexer with swappable backends
//! - `connection`: per-connection REQUEST/RESPONSE/END state machine and registry
//! - `framing`: 4-byte length-prefixed message codec
//! - `buffer`: bounded per-connection read/write buffers
//!
//! `Server` brackets the engine with `init` / `start` / `stop`.

mod acceptor;
pub mod buffer;
pub mod connection;
pub mod framing;
mod reactor;
pub mod selector;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{CloseReason, ConnState, Connection, ConnectionRegistry};
pub use framing::{Decoded, FrameCodec, FrameError, FRAME_HEADER_LEN};
pub use reactor::Reactor;

use crate::config::Config;
use crate::handler::{self, MessageHandler};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Requests a running server to stop after its current wait.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A bound server and its reactor.
pub struct Server {
    reactor: Reactor,
    local_addr: SocketAddr,
    poll_timeout: Duration,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Bind the listener and open the multiplexer.
    pub fn init(config: &Config, handler: Box<dyn MessageHandler + Send>) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listener = acceptor::create_listener(addr, config.backlog)?;
        let selector = selector::open(config.backend, config.event_capacity)?;
        let codec = FrameCodec::new(config.max_message_size);
        let reactor = Reactor::new(
            listener,
            selector,
            handler,
            codec,
            config.max_connections,
            config.event_capacity,
        )?;
        let local_addr = reactor.local_addr()?;

        info!(
            addr = %local_addr,
            backend = ?config.backend,
            max_message_size = codec.max_message_size(),
            max_connections = config.max_connections,
            "Server listening"
        );

        Ok(Self {
            reactor,
            local_addr,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            shutdown: ShutdownHandle(Arc::new(AtomicBool::new(false))),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run the reactor until shutdown is requested.
    ///
    /// An error means the multiplexer failed; the caller should `stop` and exit.
    pub fn start(&mut self) -> io::Result<()> {
        info!(addr = %self.local_addr, "Server started");

        while !self.shutdown.is_shutdown() {
            if let Err(e) = self.reactor.turn(Some(self.poll_timeout)) {
                error!(error = %e, "Reactor wait failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close every live connection and the listener, releasing the multiplexer.
    pub fn stop(self) {
        let closed = self.reactor.shutdown();
        info!(addr = %self.local_addr, closed, "Server stopped");
    }
}

/// Run a server from configuration until the reactor fails.
pub fn run(config: Config) -> io::Result<()> {
    let mut server = Server::init(&config, handler::build(config.handler))?;
    let result = server.start();
    server.stop();
    result
}
