//! Transport plumbing for glomers nodes
//!
//! This crate provides:
//! - Newline-delimited JSON framing
//! - The outbox that stamps correlation ids on outbound messages
//! - A stdio transport adapter (reader and writer tasks)

pub mod framing;
pub mod transport;

pub use framing::{Frame, FrameError, MessageCodec};
pub use transport::{Outbox, Transport, TransportError};
