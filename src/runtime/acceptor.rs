//! Listening socket and connection admission.

use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::framing::FrameCodec;
use crate::runtime::selector::{Interest, Multiplexer, Token};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use tracing::{debug, warn};

/// Outcome of one accept pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AcceptPass {
    pub admitted: usize,
    /// The listener reported would-block, so its queue is empty. When false
    /// the pass stopped on an error and queued clients may still be waiting.
    pub drained: bool,
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
pub(crate) fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}

/// Accept until the listener would block.
///
/// Failures here never reach the reactor: a connection that cannot be set
/// up is dropped (closing its socket) and the rest keep being served. A pass
/// cut short by an error is not drained; the caller must run another one
/// later, since an edge-triggered backend will not report the listener again.
pub(crate) fn accept_connections<M>(
    listener: &TcpListener,
    selector: &mut M,
    registry: &mut ConnectionRegistry<TcpStream>,
    codec: FrameCodec,
) -> AcceptPass
where
    M: Multiplexer + ?Sized,
{
    let mut admitted = 0;
    let drained = loop {
        match accept(listener) {
            Ok((stream, peer)) => {
                if admit(stream, peer, selector, registry, codec) {
                    admitted += 1;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break true,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // The peer gave up before we got to it; others may be queued
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                ) =>
            {
                debug!(error = %e, "Accept failed");
                continue;
            }
            Err(e) => {
                // e.g. descriptor exhaustion; retrying right away cannot succeed
                warn!(error = %e, "Accept failed, retrying on next turn");
                break false;
            }
        }
    };
    AcceptPass { admitted, drained }
}

#[cfg(not(test))]
fn accept(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    listener.accept()
}

#[cfg(test)]
thread_local! {
    /// Errors handed out by the next `accept` calls on this thread.
    pub(crate) static INJECTED_ACCEPT_ERRORS: std::cell::RefCell<Vec<io::Error>> =
        const { std::cell::RefCell::new(Vec::new()) };
}

#[cfg(test)]
fn accept(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    if let Some(e) = INJECTED_ACCEPT_ERRORS.with(|errors| errors.borrow_mut().pop()) {
        return Err(e);
    }
    listener.accept()
}

fn admit<M>(
    stream: TcpStream,
    peer: SocketAddr,
    selector: &mut M,
    registry: &mut ConnectionRegistry<TcpStream>,
    codec: FrameCodec,
) -> bool
where
    M: Multiplexer + ?Sized,
{
    if let Err(e) = stream.set_nonblocking(true) {
        warn!(peer = %peer, error = %e, "Failed to make connection non-blocking");
        return false;
    }

    let fd = stream.as_raw_fd();
    let conn_id = match registry.insert(Connection::new(fd, stream, peer, codec)) {
        Ok(id) => id,
        Err(_rejected) => {
            warn!(peer = %peer, max = registry.capacity(), "Connection limit reached");
            return false;
        }
    };

    if let Err(e) = selector.register(fd, Token(conn_id), Interest::Readable) {
        warn!(conn_id, peer = %peer, error = %e, "Failed to register connection");
        registry.remove(conn_id);
        return false;
    }

    debug!(conn_id, fd, peer = %peer, "Accepted connection");
    true
}
