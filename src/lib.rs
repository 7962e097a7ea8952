//! framed-reactor: a single-reactor TCP server for length-prefixed messages.
//!
//! Every message on the wire is a 4-byte little-endian length followed by
//! that many payload bytes. One thread accepts clients, reads one request at
//! a time per connection, hands it to a [`MessageHandler`] and writes back
//! the framed response before reading the next.

pub mod config;
pub mod handler;
pub mod runtime;

pub use config::{Backend, Config, ConfigError, HandlerKind};
pub use handler::MessageHandler;
pub use runtime::{Server, ShutdownHandle};
