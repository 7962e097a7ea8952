//! Readiness multiplexing.
//!
//! One interface over the OS readiness facility, with swappable backends:
//! - `MioSelector`: epoll on Linux, kqueue on macOS (edge-triggered)
//! - `PollSelector`: plain poll(2) (level-triggered)
//!
//! Both guarantee that a readiness condition which persists is reported
//! again: level-triggered by construction, edge-triggered because every
//! interest change re-arms the descriptor and connections always drain
//! their socket until it would block.
//!
//! Events already collected for a descriptor that is deregistered later in
//! the same batch can still be returned. Callers look the token up and drop
//! events whose owner is gone.

mod mio_impl;
mod poll_impl;

pub use mio_impl::MioSelector;
pub use poll_impl::PollSelector;

use crate::config::Backend;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Identifies a registered descriptor in readiness events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

/// What a descriptor is waited on for. Errors and hang-ups are always reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// One readiness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Register descriptors and wait for them to become ready.
pub trait Multiplexer {
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd`. Must be called while `fd` is still open.
    fn deregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block until at least one registered descriptor is ready or `timeout`
    /// elapses, appending reports to `events`.
    ///
    /// Interruption by a signal returns `Ok` with nothing appended.
    fn wait(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()>;
}

/// Open the backend selected by configuration.
pub fn open(backend: Backend, capacity: usize) -> io::Result<Box<dyn Multiplexer + Send>> {
    Ok(match backend {
        Backend::Mio => Box::new(MioSelector::new(capacity)?),
        Backend::Poll => Box::new(PollSelector::new(capacity)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    const WAIT: Option<Duration> = Some(Duration::from_millis(200));

    fn backends() -> Vec<Box<dyn Multiplexer + Send>> {
        vec![
            open(Backend::Mio, 16).unwrap(),
            open(Backend::Poll, 16).unwrap(),
        ]
    }

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn test_reports_readable() {
        for mut selector in backends() {
            let (a, mut b) = pair();
            selector
                .register(a.as_raw_fd(), Token(7), Interest::Readable)
                .unwrap();

            b.write_all(b"ping").unwrap();

            let mut events = Vec::new();
            selector.wait(&mut events, WAIT).unwrap();
            let ev = events.iter().find(|e| e.token == Token(7)).unwrap();
            assert!(ev.readable);
        }
    }

    #[test]
    fn test_reports_writable_after_modify() {
        for mut selector in backends() {
            let (a, _b) = pair();
            selector
                .register(a.as_raw_fd(), Token(1), Interest::Readable)
                .unwrap();

            // Nothing to read yet
            let mut events = Vec::new();
            selector
                .wait(&mut events, Some(Duration::from_millis(10)))
                .unwrap();
            assert!(events.is_empty());

            selector
                .modify(a.as_raw_fd(), Token(1), Interest::Writable)
                .unwrap();
            selector.wait(&mut events, WAIT).unwrap();
            let ev = events.iter().find(|e| e.token == Token(1)).unwrap();
            assert!(ev.writable);
        }
    }

    #[test]
    fn test_persisting_readiness_is_reported_again() {
        for mut selector in backends() {
            let (mut a, mut b) = pair();
            selector
                .register(a.as_raw_fd(), Token(2), Interest::Readable)
                .unwrap();
            b.write_all(b"0123456789").unwrap();

            let mut events = Vec::new();
            selector.wait(&mut events, WAIT).unwrap();
            assert_eq!(events.len(), 1);

            // Leave data unread, re-arm, and expect another report
            let mut small = [0u8; 2];
            a.read_exact(&mut small).unwrap();
            selector
                .modify(a.as_raw_fd(), Token(2), Interest::Readable)
                .unwrap();

            events.clear();
            selector.wait(&mut events, WAIT).unwrap();
            assert!(events.iter().any(|e| e.token == Token(2) && e.readable));
        }
    }

    #[test]
    fn test_deregistered_descriptor_is_silent() {
        for mut selector in backends() {
            let (a, mut b) = pair();
            selector
                .register(a.as_raw_fd(), Token(3), Interest::Readable)
                .unwrap();
            selector.deregister(a.as_raw_fd()).unwrap();

            b.write_all(b"late").unwrap();

            let mut events = Vec::new();
            selector
                .wait(&mut events, Some(Duration::from_millis(20)))
                .unwrap();
            assert!(events.iter().all(|e| e.token != Token(3)));
        }
    }

    #[test]
    fn test_peer_close_is_reported() {
        for mut selector in backends() {
            let (a, b) = pair();
            selector
                .register(a.as_raw_fd(), Token(4), Interest::Readable)
                .unwrap();
            drop(b);

            let mut events = Vec::new();
            selector.wait(&mut events, WAIT).unwrap();
            let ev = events.iter().find(|e| e.token == Token(4)).unwrap();
            assert!(ev.readable || ev.error);
        }
    }
}
