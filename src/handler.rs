//! Message handlers.
//!
//! A handler turns one inbound payload into one outbound payload. It runs
//! inline on the reactor thread, so it must not block or do its own I/O.
//!
//! ## Built-in handlers
//! - `Echo`: payload back unchanged
//! - `Ack`: fixed `ok` acknowledgement
//! - `Reply`: short text reply quoting the payload

use crate::config::HandlerKind;

/// Pure function from request payload to response payload.
pub trait MessageHandler {
    fn handle(&mut self, payload: &[u8]) -> Vec<u8>;
}

impl<F> MessageHandler for F
where
    F: FnMut(&[u8]) -> Vec<u8>,
{
    fn handle(&mut self, payload: &[u8]) -> Vec<u8> {
        self(payload)
    }
}

/// Returns the payload unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl MessageHandler for Echo {
    fn handle(&mut self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }
}

/// Acknowledges every payload with `ok`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ack;

const ACK: &[u8] = b"ok";

impl MessageHandler for Ack {
    fn handle(&mut self, _payload: &[u8]) -> Vec<u8> {
        ACK.to_vec()
    }
}

/// Answers `Response for message: <payload> from server`.
///
/// The payload is decoded as UTF-8, with invalid sequences replaced.
#[derive(Debug, Default, Clone, Copy)]
pub struct Reply;

impl MessageHandler for Reply {
    fn handle(&mut self, payload: &[u8]) -> Vec<u8> {
        format!(
            "Response for message: {} from server",
            String::from_utf8_lossy(payload)
        )
        .into_bytes()
    }
}

/// Build the handler selected by configuration.
pub fn build(kind: HandlerKind) -> Box<dyn MessageHandler + Send> {
    match kind {
        HandlerKind::Echo => Box::new(Echo),
        HandlerKind::Ack => Box::new(Ack),
        HandlerKind::Reply => Box::new(Reply),
    }
}
