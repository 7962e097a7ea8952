//! Length-prefixed message framing.
//!
//! Every message, request or response, is a 4-byte little-endian payload
//! length followed by exactly that many payload bytes:
//!
//! ```text
//! [len: u32 LE][payload: len bytes]
//!
//! Example:
//! 05 00 00 00 68 65 6c 6c 6f   ("hello")
//! ```
//!
//! A prefix larger than the configured maximum is a protocol violation.
//! Once that happens the stream can no longer be trusted to be in sync, so
//! the caller closes the connection instead of trying to recover.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Result of trying to pull one frame off the front of a buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete payload. Its frame has been removed from the buffer.
    Frame(Bytes),
    /// Not enough bytes buffered yet.
    Incomplete,
    /// The length prefix exceeds the maximum message size.
    TooLarge(usize),
}

/// Framing failure on the encode side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Payload longer than the maximum message size.
    TooLarge { len: usize, max: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds maximum of {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Splits and builds frames, bounded by `max_message_size`.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl FrameCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Largest number of bytes one frame can occupy on the wire.
    pub fn max_frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.max_message_size
    }

    /// Try to extract one frame from the front of `buf`.
    ///
    /// On success the consumed `4 + len` bytes are split off and whatever
    /// follows stays at the head of `buf` for the next call, so several
    /// pipelined frames can be pulled out of a single read.
    pub fn decode(&self, buf: &mut BytesMut) -> Decoded {
        if buf.len() < FRAME_HEADER_LEN {
            return Decoded::Incomplete;
        }

        let mut header = &buf[..FRAME_HEADER_LEN];
        let len = header.get_u32_le() as usize;
        if len > self.max_message_size {
            return Decoded::TooLarge(len);
        }

        if buf.len() < FRAME_HEADER_LEN + len {
            return Decoded::Incomplete;
        }

        let mut frame = buf.split_to(FRAME_HEADER_LEN + len);
        frame.advance(FRAME_HEADER_LEN);
        Decoded::Frame(frame.freeze())
    }

    /// Write `payload` as one frame into `dst`, replacing its contents.
    pub fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        if payload.len() > self.max_message_size {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: self.max_message_size,
            });
        }

        dst.clear();
        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(payload);
        Ok(())
    }
}
