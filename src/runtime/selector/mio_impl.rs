//! mio backend.
//!
//! Readiness-based model: poll tells us when descriptors are ready,
//! then the reactor performs non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS, both edge-triggered.

use super::{Interest, Multiplexer, Readiness, Token};
use mio::unix::SourceFd;
use mio::{Events, Poll};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct MioSelector {
    poll: Poll,
    events: Events,
}

impl MioSelector {
    /// Create a selector that collects up to `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }
}

fn to_mio(interest: Interest) -> mio::Interest {
    match interest {
        Interest::Readable => mio::Interest::READABLE,
        Interest::Writable => mio::Interest::WRITABLE,
    }
}

impl Multiplexer for MioSelector {
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), mio::Token(token.0), to_mio(interest))
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), mio::Token(token.0), to_mio(interest))
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        events.extend(self.events.iter().map(|event| Readiness {
            token: Token(event.token().0),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            error: event.is_error(),
        }));
        Ok(())
    }
}
