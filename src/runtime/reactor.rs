//! Single-threaded reactor.
//!
//! One thread waits on the multiplexer, then dispatches each readiness event:
//! the listener token goes to the acceptor, every other token to the
//! connection it names. Waiting is the only suspension point; all socket I/O
//! is non-blocking.
//!
//! A connection that reaches `End` is deregistered, removed from the registry
//! and closed before the next event is looked at, so no later event in the
//! same batch can reach it. Events for tokens that are no longer registered
//! are dropped.
//!
//! An accept pass cut short by an error (e.g. EMFILE) is retried on every
//! following turn until one drains the listener queue. Edge-triggered
//! backends report the listener once per new arrival, so clients already
//! queued would otherwise wait for an unrelated connect.

use crate::handler::MessageHandler;
use crate::runtime::acceptor::{accept_connections, AcceptPass};
use crate::runtime::connection::{CloseReason, ConnectionRegistry};
use crate::runtime::framing::FrameCodec;
use crate::runtime::selector::{Interest, Multiplexer, Readiness, Token};
use chrono::Utc;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use tracing::{debug, trace};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Longest wait while an accept pass is outstanding.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

pub struct Reactor {
    selector: Box<dyn Multiplexer + Send>,
    listener: TcpListener,
    registry: ConnectionRegistry<TcpStream>,
    handler: Box<dyn MessageHandler + Send>,
    codec: FrameCodec,
    events: Vec<Readiness>,
    /// Last accept pass stopped before the listener queue was empty.
    accept_pending: bool,
}

impl Reactor {
    /// Take ownership of a bound, non-blocking listener and register it.
    pub fn new(
        listener: TcpListener,
        mut selector: Box<dyn Multiplexer + Send>,
        handler: Box<dyn MessageHandler + Send>,
        codec: FrameCodec,
        max_connections: usize,
        event_capacity: usize,
    ) -> io::Result<Self> {
        selector.register(listener.as_raw_fd(), LISTENER_TOKEN, Interest::Readable)?;

        Ok(Self {
            selector,
            listener,
            registry: ConnectionRegistry::new(max_connections),
            handler,
            codec,
            events: Vec::with_capacity(event_capacity),
            accept_pending: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.registry.len()
    }

    /// Wait once and dispatch every reported event.
    ///
    /// Returns the number of events handled. An error means the multiplexer
    /// itself failed and the reactor cannot continue.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = if self.accept_pending {
            Some(timeout.map_or(ACCEPT_RETRY, |t| t.min(ACCEPT_RETRY)))
        } else {
            timeout
        };

        self.events.clear();
        self.selector.wait(&mut self.events, timeout)?;

        let mut accepted = false;
        for i in 0..self.events.len() {
            let event = self.events[i];
            if event.token == LISTENER_TOKEN {
                self.accept();
                accepted = true;
            } else {
                self.dispatch(event);
            }
        }

        if self.accept_pending && !accepted {
            self.accept();
        }

        Ok(self.events.len())
    }

    fn accept(&mut self) {
        let AcceptPass { admitted, drained } = accept_connections(
            &self.listener,
            &mut *self.selector,
            &mut self.registry,
            self.codec,
        );
        self.accept_pending = !drained;
        trace!(admitted, drained, live = self.registry.len(), "Accept pass");
    }

    fn dispatch(&mut self, event: Readiness) {
        let conn_id = event.token.0;
        let Some(conn) = self.registry.get_mut(conn_id) else {
            trace!(conn_id, "Event for evicted connection ignored");
            return;
        };

        // Eviction normally follows End at once; covers a slot closed elsewhere
        if conn.is_closed() {
            self.evict(conn_id);
            return;
        }

        trace!(
            conn_id,
            readable = event.readable,
            writable = event.writable,
            error = event.error,
            state = ?conn.state(),
            "Readiness"
        );

        conn.on_ready(&mut *self.handler);

        if conn.is_closed() {
            self.evict(conn_id);
        } else {
            self.sync_interest(conn_id);
        }
    }

    /// Point the multiplexer at what the connection's state now needs.
    fn sync_interest(&mut self, conn_id: usize) {
        let Some(conn) = self.registry.get_mut(conn_id) else {
            return;
        };

        let wanted = conn.interest();
        if wanted == conn.registered_interest() {
            return;
        }

        match self.selector.modify(conn.fd(), Token(conn_id), wanted) {
            Ok(()) => conn.set_registered_interest(wanted),
            Err(e) => {
                conn.close(CloseReason::InterestFailed(e.kind()));
                self.evict(conn_id);
            }
        }
    }

    /// Deregister, remove and close a connection. No-op if already gone.
    fn evict(&mut self, conn_id: usize) {
        let Some(conn) = self.registry.remove(conn_id) else {
            return;
        };

        if let Err(e) = self.selector.deregister(conn.fd()) {
            debug!(conn_id, error = %e, "Failed to deregister connection");
        }

        let lifetime = Utc::now() - conn.accepted_at();
        debug!(
            conn_id,
            peer = %conn.peer(),
            reason = %conn.close_reason().unwrap_or(CloseReason::Shutdown),
            lifetime_ms = lifetime.num_milliseconds(),
            "Connection closed"
        );
        // Dropping `conn` closes the descriptor
    }

    /// Close every connection and the listener, releasing the multiplexer.
    ///
    /// Returns the number of connections that were still live.
    pub fn shutdown(mut self) -> usize {
        let ids: Vec<usize> = self.registry.iter().map(|(id, _)| id).collect();
        for &conn_id in &ids {
            if let Some(conn) = self.registry.get_mut(conn_id) {
                conn.close(CloseReason::Shutdown);
            }
            self.evict(conn_id);
        }

        if let Err(e) = self.selector.deregister(self.listener.as_raw_fd()) {
            debug!(error = %e, "Failed to deregister listener");
        }
        ids.len()
    }
}
