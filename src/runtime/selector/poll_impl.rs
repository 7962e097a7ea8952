//! poll(2) backend.
//!
//! Level-triggered: the pollfd table is the interest set, and every wait
//! reports every descriptor whose condition still holds.

use super::{Interest, Multiplexer, Readiness, Token};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct PollSelector {
    /// Interest set handed to poll(2).
    fds: Vec<libc::pollfd>,
    /// Token for each entry of `fds`, same index.
    tokens: Vec<Token>,
    /// Descriptor to its index in `fds`.
    index: HashMap<RawFd, usize>,
}

impl PollSelector {
    pub fn new(capacity: usize) -> Self {
        Self {
            fds: Vec::with_capacity(capacity),
            tokens: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

fn to_events(interest: Interest) -> libc::c_short {
    match interest {
        Interest::Readable => libc::POLLIN,
        Interest::Writable => libc::POLLOUT,
    }
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            // Round up so a sub-millisecond timeout does not become a busy loop
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

fn not_registered(fd: RawFd) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("descriptor {fd} is not registered"),
    )
}

impl Multiplexer for PollSelector {
    fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        if self.index.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("descriptor {fd} is already registered"),
            ));
        }

        self.index.insert(fd, self.fds.len());
        self.fds.push(libc::pollfd {
            fd,
            events: to_events(interest),
            revents: 0,
        });
        self.tokens.push(token);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let idx = *self.index.get(&fd).ok_or_else(|| not_registered(fd))?;
        self.fds[idx].events = to_events(interest);
        self.tokens[idx] = token;
        Ok(())
    }

    fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let idx = self.index.remove(&fd).ok_or_else(|| not_registered(fd))?;
        self.fds.swap_remove(idx);
        self.tokens.swap_remove(idx);

        // Fix up the entry that was moved into the hole
        if let Some(moved) = self.fds.get(idx) {
            self.index.insert(moved.fd, idx);
        }
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        for pfd in &mut self.fds {
            pfd.revents = 0;
        }

        // SAFETY: `fds` is a valid, exclusively borrowed array of `len` pollfds
        // for the duration of the call.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for (pfd, token) in self.fds.iter().zip(&self.tokens) {
            let revents = pfd.revents;
            if revents == 0 {
                continue;
            }
            events.push(Readiness {
                token: *token,
                readable: revents & (libc::POLLIN | libc::POLLHUP) != 0,
                writable: revents & libc::POLLOUT != 0,
                error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            });
        }
        Ok(())
    }
}
