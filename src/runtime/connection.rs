//! Connection state machine for managing TCP connections.
//!
//! Each connection moves through three states:
//!
//! ```text
//!            full frame parsed, response built
//!   REQUEST ──────────────────────────────────▶ RESPONSE
//!      ▲  │                                        │  │
//!      │  │ eof / read error / frame too large     │  │ write error
//!      │  ▼                                        │  ▼
//!      │ END ◀─────────────────────────────────────┘ END
//!      └───────────── response fully flushed ──────┘
//! ```
//!
//! All socket I/O is non-blocking. Would-block parks the connection until the
//! next readiness event; interrupted calls are retried in place; any other
//! failure ends the connection without affecting the rest of the reactor.

use crate::handler::MessageHandler;
use crate::runtime::buffer::{Fill, Flush, ReadBuffer, WriteBuffer};
use crate::runtime::framing::{Decoded, FrameCodec, FrameError};
use crate::runtime::selector::Interest;
use chrono::{DateTime, Utc};
use slab::Slab;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use tracing::trace;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading and parsing request frames.
    Request,
    /// Flushing a framed response.
    Response,
    /// Terminal; the reactor closes and evicts the connection.
    End,
}

/// Why a connection reached `ConnState::End`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream. `partial` is true if unparsed bytes were left.
    Eof { partial: bool },
    ReadFailed(io::ErrorKind),
    WriteFailed(io::ErrorKind),
    /// Length prefix above the maximum message size.
    FrameTooLarge(usize),
    /// Handler produced a response above the maximum message size.
    ResponseTooLarge(usize),
    /// The multiplexer refused an interest change.
    InterestFailed(io::ErrorKind),
    /// Server is stopping.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof { partial: false } => write!(f, "EOF"),
            CloseReason::Eof { partial: true } => write!(f, "unexpected EOF"),
            CloseReason::ReadFailed(kind) => write!(f, "read failed: {kind}"),
            CloseReason::WriteFailed(kind) => write!(f, "write failed: {kind}"),
            CloseReason::FrameTooLarge(len) => write!(f, "request frame too large: {len}"),
            CloseReason::ResponseTooLarge(len) => write!(f, "response too large: {len}"),
            CloseReason::InterestFailed(kind) => write!(f, "interest change failed: {kind}"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    fd: RawFd,
    stream: S,
    peer: SocketAddr,
    state: ConnState,
    codec: FrameCodec,
    read_buf: ReadBuffer,
    write_buf: WriteBuffer,
    /// Interest the multiplexer currently holds for this descriptor.
    registered: Interest,
    close_reason: Option<CloseReason>,
    accepted_at: DateTime<Utc>,
}

impl<S: Read + Write> Connection<S> {
    /// Create a new connection in the `Request` state, registered for reads.
    pub fn new(fd: RawFd, stream: S, peer: SocketAddr, codec: FrameCodec) -> Self {
        Self {
            fd,
            stream,
            peer,
            state: ConnState::Request,
            codec,
            read_buf: ReadBuffer::new(codec.max_frame_len()),
            write_buf: WriteBuffer::new(),
            registered: Interest::Readable,
            close_reason: None,
            accepted_at: Utc::now(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::End
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn accepted_at(&self) -> DateTime<Utc> {
        self.accepted_at
    }

    /// Unparsed inbound bytes.
    pub fn buffered_input(&self) -> usize {
        self.read_buf.len()
    }

    /// Outbound bytes not yet sent.
    pub fn pending_output(&self) -> usize {
        self.write_buf.pending()
    }

    /// Interest matching the current state.
    pub fn interest(&self) -> Interest {
        match self.state {
            ConnState::Response => Interest::Writable,
            ConnState::Request | ConnState::End => Interest::Readable,
        }
    }

    pub fn registered_interest(&self) -> Interest {
        self.registered
    }

    pub fn set_registered_interest(&mut self, interest: Interest) {
        self.registered = interest;
    }

    /// Move to `End`. The first reason recorded wins.
    pub fn close(&mut self, reason: CloseReason) {
        if self.state != ConnState::End {
            trace!(fd = self.fd, %reason, "Connection ending");
            self.state = ConnState::End;
            self.close_reason = Some(reason);
        }
    }

    /// Drive the connection after a readiness notification.
    ///
    /// The notification is only a hint: the work done depends on the current
    /// state, not on which readiness was reported.
    pub fn on_ready<H>(&mut self, handler: &mut H)
    where
        H: MessageHandler + ?Sized,
    {
        match self.state {
            ConnState::Request => self.handle_request(handler),
            ConnState::Response => {
                self.handle_response();
                // Pipelined requests may already be buffered
                if self.state == ConnState::Request {
                    self.handle_request(handler);
                }
            }
            ConnState::End => {}
        }
    }

    /// Parse buffered frames, then read until the socket would block or the
    /// connection leaves `Request`.
    fn handle_request<H>(&mut self, handler: &mut H)
    where
        H: MessageHandler + ?Sized,
    {
        while self.state == ConnState::Request {
            if self.try_one_request(handler) {
                continue;
            }
            if self.state != ConnState::Request {
                break;
            }

            match self.read_buf.fill_from(&mut self.stream) {
                Ok(Fill::Read(n)) => {
                    trace!(fd = self.fd, n, buffered = self.read_buf.len(), "Read");
                }
                Ok(Fill::WouldBlock) => break,
                Ok(Fill::Eof) => {
                    let partial = !self.read_buf.is_empty();
                    self.close(CloseReason::Eof { partial });
                }
                Err(e) => self.close(CloseReason::ReadFailed(e.kind())),
            }
        }
    }

    /// Extract and answer one frame from the read buffer.
    ///
    /// Returns true if a frame was answered and its response fully flushed,
    /// so the caller can look for the next one.
    fn try_one_request<H>(&mut self, handler: &mut H) -> bool
    where
        H: MessageHandler + ?Sized,
    {
        let payload = match self.codec.decode(self.read_buf.bytes_mut()) {
            Decoded::Frame(payload) => payload,
            Decoded::Incomplete => return false,
            Decoded::TooLarge(len) => {
                self.close(CloseReason::FrameTooLarge(len));
                return false;
            }
        };

        trace!(fd = self.fd, len = payload.len(), "Request");
        let response = handler.handle(&payload);

        if let Err(FrameError::TooLarge { len, .. }) = self.write_buf.load(&self.codec, &response)
        {
            self.close(CloseReason::ResponseTooLarge(len));
            return false;
        }

        self.state = ConnState::Response;
        self.handle_response();
        self.state == ConnState::Request
    }

    /// Flush the pending response from the current offset.
    fn handle_response(&mut self) {
        match self.write_buf.flush_to(&mut self.stream) {
            Ok(Flush::Done) => {
                trace!(fd = self.fd, "Response flushed");
                self.state = ConnState::Request;
            }
            Ok(Flush::Pending) => {
                trace!(
                    fd = self.fd,
                    sent = self.write_buf.sent(),
                    total = self.write_buf.len(),
                    "Response pending"
                );
            }
            Err(e) => self.close(CloseReason::WriteFailed(e.kind())),
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// The registry is the only owner of a connection. Removing it drops the
/// stream, which closes the descriptor, so a connection is closed exactly
/// once and removing an absent key is a no-op.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Result<usize, Connection<S>> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: usize) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Iterate over all connections.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection<S>)> {
        self.connections.iter()
    }

    /// Remove every connection.
    pub fn drain(&mut self) -> impl Iterator<Item = Connection<S>> + '_ {
        self.connections.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Ack, Echo};
    use crate::runtime::testing::{frame, ReadStep, ScriptedStream, WriteStep};

    const MAX: usize = 4096;

    fn conn(stream: ScriptedStream) -> Connection<ScriptedStream> {
        Connection::new(3, stream, "127.0.0.1:40000".parse().unwrap(), FrameCodec::new(MAX))
    }

    #[test]
    fn test_echo_hello() {
        let stream = ScriptedStream::new().then_read(ReadStep::Data(frame(b"hello")));
        let mut c = conn(stream);

        c.on_ready(&mut Echo);

        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.stream.written, [5, 0, 0, 0, b'h', b'e', b'l', b'l', b'o']);
        assert_eq!(c.buffered_input(), 0);
        assert_eq!(c.interest(), Interest::Readable);
    }

    #[test]
    fn test_empty_payload_ack() {
        let stream = ScriptedStream::new().then_read(ReadStep::Data(vec![0, 0, 0, 0]));
        let mut c = conn(stream);

        c.on_ready(&mut Ack);

        assert_eq!(c.stream.written, [2, 0, 0, 0, b'o', b'k']);
        assert_eq!(c.state(), ConnState::Request);
    }

    #[test]
    fn test_byte_at_a_time_matches_whole() {
        let wire = frame(b"split across many reads");

        let mut whole = conn(ScriptedStream::new().then_read(ReadStep::Data(wire.clone())));
        whole.on_ready(&mut Echo);

        let mut split = conn(ScriptedStream::new());
        for (i, byte) in wire.iter().enumerate() {
            split.stream.push_read(ReadStep::Data(vec![*byte]));
            split.stream.push_read(ReadStep::WouldBlock);
            split.on_ready(&mut Echo);

            if i + 1 < wire.len() {
                assert!(split.stream.written.is_empty());
                assert_eq!(split.buffered_input(), i + 1);
            }
        }

        assert_eq!(split.stream.written, whole.stream.written);
        assert_eq!(split.stream.written, wire);
    }

    #[test]
    fn test_pipelined_frames_answered_in_order() {
        let mut wire = frame(b"first");
        wire.extend_from_slice(&frame(b"second"));
        let stream = ScriptedStream::new().then_read(ReadStep::Data(wire));
        let mut c = conn(stream);

        let mut seen = Vec::new();
        let mut handler = |payload: &[u8]| {
            seen.push(payload.to_vec());
            payload.to_ascii_uppercase()
        };
        c.on_ready(&mut handler);

        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
        let mut expected = frame(b"FIRST");
        expected.extend_from_slice(&frame(b"SECOND"));
        assert_eq!(c.stream.written, expected);
        assert_eq!(c.state(), ConnState::Request);
    }

    #[test]
    fn test_pipelined_frame_waits_for_blocked_response() {
        let mut wire = frame(b"a");
        wire.extend_from_slice(&frame(b"b"));
        let stream = ScriptedStream::new()
            .then_read(ReadStep::Data(wire))
            .then_write(WriteStep::WouldBlock);
        let mut c = conn(stream);

        c.on_ready(&mut Echo);
        assert_eq!(c.state(), ConnState::Response);
        assert_eq!(c.interest(), Interest::Writable);
        assert!(c.stream.written.is_empty());
        // Second frame stays buffered until the first response is out
        assert_eq!(c.buffered_input(), 5);

        c.on_ready(&mut Echo);
        let mut expected = frame(b"a");
        expected.extend_from_slice(&frame(b"b"));
        assert_eq!(c.stream.written, expected);
        assert_eq!(c.state(), ConnState::Request);
        assert_eq!(c.buffered_input(), 0);
    }

    #[test]
    fn test_oversized_prefix_ends_without_response() {
        let stream =
            ScriptedStream::new().then_read(ReadStep::Data(10_000_000u32.to_le_bytes().to_vec()));
        let mut c = conn(stream);

        c.on_ready(&mut Echo);

        assert!(c.is_closed());
        assert_eq!(c.close_reason(), Some(CloseReason::FrameTooLarge(10_000_000)));
        assert!(c.stream.written.is_empty());
    }

    #[test]
    fn test_eof_with_partial_frame() {
        let stream = ScriptedStream::new()
            .then_read(ReadStep::Data(vec![9, 0, 0, 0, 1]))
            .then_read(ReadStep::Eof);
        let mut c = conn(stream);

        c.on_ready(&mut Echo);

        assert!(c.is_closed());
        assert_eq!(c.close_reason(), Some(CloseReason::Eof { partial: true }));
    }

    #[test]
    fn test_clean_eof() {
        let mut c = conn(ScriptedStream::new().then_read(ReadStep::Eof));
        c.on_ready(&mut Echo);
        assert_eq!(c.close_reason(), Some(CloseReason::Eof { partial: false }));
    }

    #[test]
    fn test_read_error_is_fatal() {
        let stream = ScriptedStream::new()
            .then_read(ReadStep::Fail(io::ErrorKind::ConnectionReset));
        let mut c = conn(stream);

        c.on_ready(&mut Echo);

        assert_eq!(
            c.close_reason(),
            Some(CloseReason::ReadFailed(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let stream = ScriptedStream::new()
            .then_read(ReadStep::Interrupted)
            .then_read(ReadStep::Data(frame(b"hi")));
        let mut c = conn(stream);

        c.on_ready(&mut Echo);

        assert_eq!(c.stream.written, frame(b"hi"));
        assert_eq!(c.state(), ConnState::Request);
    }

    #[test]
    fn test_blocked_write_does_not_grow_or_resend() {
        let stream = ScriptedStream::new()
            .then_read(ReadStep::Data(frame(b"payload")))
            .then_write(WriteStep::Accept(3))
            .then_write(WriteStep::WouldBlock)
            .then_write(WriteStep::WouldBlock)
            .then_write(WriteStep::WouldBlock)
            .then_write(WriteStep::WouldBlock);
        let mut c = conn(stream);

        c.on_ready(&mut Echo);
        for _ in 0..3 {
            assert_eq!(c.state(), ConnState::Response);
            assert_eq!(c.pending_output(), 8);
            c.on_ready(&mut Echo);
        }

        assert_eq!(c.state(), ConnState::Response);
        assert_eq!(c.write_buf.len(), 11);
        assert_eq!(c.stream.written, &frame(b"payload")[..3]);
    }

    #[test]
    fn test_write_error_is_fatal() {
        let stream = ScriptedStream::new()
            .then_read(ReadStep::Data(frame(b"x")))
            .then_write(WriteStep::Fail(io::ErrorKind::BrokenPipe));
        let mut c = conn(stream);

        c.on_ready(&mut Echo);

        assert_eq!(
            c.close_reason(),
            Some(CloseReason::WriteFailed(io::ErrorKind::BrokenPipe))
        );
    }

    #[test]
    fn test_oversized_response_ends_connection() {
        let stream = ScriptedStream::new().then_read(ReadStep::Data(frame(b"grow")));
        let mut c = conn(stream);

        c.on_ready(&mut |_: &[u8]| vec![0u8; MAX + 1]);

        assert_eq!(c.close_reason(), Some(CloseReason::ResponseTooLarge(MAX + 1)));
        assert!(c.stream.written.is_empty());
    }

    #[test]
    fn test_first_close_reason_wins() {
        let mut c = conn(ScriptedStream::new());
        c.close(CloseReason::Shutdown);
        c.close(CloseReason::Eof { partial: false });
        assert_eq!(c.close_reason(), Some(CloseReason::Shutdown));

        // Closed connections ignore readiness
        c.on_ready(&mut Echo);
        assert_eq!(c.stream.read_calls, 0);
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let id1 = registry.insert(conn(ScriptedStream::new())).unwrap();
        let id2 = registry.insert(conn(ScriptedStream::new())).unwrap();

        // At capacity
        assert!(registry.insert(conn(ScriptedStream::new())).is_err());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);
        assert!(registry.contains(id2));

        // Eviction happens once; a stale lookup finds nothing
        registry.get_mut(id1).unwrap().close(CloseReason::Shutdown);
        assert!(registry.remove(id1).is_some());
        assert!(registry.remove(id1).is_none());
        assert!(registry.get(id1).is_none());
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.drain().count(), 1);
        assert!(registry.is_empty());
    }
}
