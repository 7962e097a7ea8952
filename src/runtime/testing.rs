//! Scripted in-memory stream for exercising non-blocking I/O paths.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// One scripted outcome of a `read` call.
#[derive(Debug)]
pub(crate) enum ReadStep {
    Data(Vec<u8>),
    WouldBlock,
    Interrupted,
    Eof,
    Fail(io::ErrorKind),
}

/// One scripted outcome of a `write` call.
#[derive(Debug)]
pub(crate) enum WriteStep {
    /// Accept at most this many bytes.
    Accept(usize),
    WouldBlock,
    Interrupted,
    Fail(io::ErrorKind),
}

/// Stream whose reads and writes follow a script.
///
/// An exhausted read script reports would-block; an exhausted write script
/// accepts everything.
#[derive(Debug, Default)]
pub(crate) struct ScriptedStream {
    reads: VecDeque<ReadStep>,
    writes: VecDeque<WriteStep>,
    pub written: Vec<u8>,
    pub read_calls: usize,
    pub write_calls: usize,
}

impl ScriptedStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_read(mut self, step: ReadStep) -> Self {
        self.reads.push_back(step);
        self
    }

    pub fn then_write(mut self, step: WriteStep) -> Self {
        self.writes.push_back(step);
        self
    }

    pub fn push_read(&mut self, step: ReadStep) {
        self.reads.push_back(step);
    }
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_calls += 1;
        match self.reads.pop_front() {
            None | Some(ReadStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
            Some(ReadStep::Fail(kind)) => Err(kind.into()),
            Some(ReadStep::Eof) => {
                self.reads.push_front(ReadStep::Eof);
                Ok(0)
            }
            Some(ReadStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.reads.push_front(ReadStep::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Write for ScriptedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_calls += 1;
        match self.writes.pop_front() {
            None => {
                self.written.extend_from_slice(buf);
                Ok(buf.len())
            }
            Some(WriteStep::Accept(max)) => {
                let n = max.min(buf.len());
                self.written.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            Some(WriteStep::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
            Some(WriteStep::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
            Some(WriteStep::Fail(kind)) => Err(kind.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Frame `payload` the way a client would put it on the wire.
pub(crate) fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}
