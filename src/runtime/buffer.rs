//! Per-connection I/O buffers.
//!
//! `ReadBuffer` accumulates unparsed input and never grows past one maximal
//! frame (`4 + max_message_size`). Frames are split off its head as they
//! complete, leaving any pipelined tail in place.
//!
//! `WriteBuffer` holds one framed response plus the offset of the next byte
//! to send, so a flush interrupted by would-block resumes exactly where it
//! stopped.

use crate::runtime::framing::{FrameCodec, FrameError};
use bytes::BytesMut;
use std::io::{self, Read, Write};

/// Upper bound on a single read syscall.
const READ_CHUNK: usize = 16 * 1024;

/// Outcome of one `ReadBuffer::fill_from` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// `n > 0` bytes were appended.
    Read(usize),
    /// No data available right now.
    WouldBlock,
    /// Peer closed its side of the stream.
    Eof,
}

/// Outcome of one `WriteBuffer::flush_to` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Every buffered byte has been sent.
    Done,
    /// The socket stopped accepting bytes; some remain.
    Pending,
}

/// Bounded accumulator for inbound bytes.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: BytesMut,
    limit: usize,
}

impl ReadBuffer {
    /// Create a buffer that holds at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit.min(READ_CHUNK)),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes that can still be appended before the limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.buf.len()
    }

    /// Buffered bytes, for the frame decoder.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Perform one non-blocking read, appending at the current fill offset.
    ///
    /// `Interrupted` is retried in place. Any other error is returned to the
    /// caller, which treats it as fatal for the connection.
    pub fn fill_from<R: Read>(&mut self, reader: &mut R) -> io::Result<Fill> {
        let room = self.remaining().min(READ_CHUNK);
        if room == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "read buffer full without a complete frame",
            ));
        }

        let start = self.buf.len();
        self.buf.resize(start + room, 0);

        let result = loop {
            match reader.read(&mut self.buf[start..]) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match result {
            Ok(0) => {
                self.buf.truncate(start);
                Ok(Fill::Eof)
            }
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(Fill::Read(n))
            }
            Err(e) => {
                self.buf.truncate(start);
                if e.kind() == io::ErrorKind::WouldBlock {
                    Ok(Fill::WouldBlock)
                } else {
                    Err(e)
                }
            }
        }
    }
}

/// Pending output and the offset of the next byte to send.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    buf: BytesMut,
    sent: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total buffered length, sent bytes included.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Offset of the next byte to send.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Bytes still waiting to be sent.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.sent
    }

    /// Frame `payload` as the next response, replacing prior contents.
    ///
    /// Only called once the previous response is fully flushed.
    pub fn load(&mut self, codec: &FrameCodec, payload: &[u8]) -> Result<(), FrameError> {
        debug_assert_eq!(self.pending(), 0, "response loaded over unsent bytes");
        codec.encode(payload, &mut self.buf)?;
        self.sent = 0;
        Ok(())
    }

    /// Write from `sent` until everything is flushed or the socket would block.
    ///
    /// A full flush clears the buffer and resets the offset. `Interrupted` is
    /// retried in place; any other error is returned.
    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> io::Result<Flush> {
        while self.sent < self.buf.len() {
            match writer.write(&self.buf[self.sent..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Flush::Pending);
                }
                Err(e) => return Err(e),
            }
        }

        self.buf.clear();
        self.sent = 0;
        Ok(Flush::Done)
    }
}
