//! Wire protocol spoken between kiln and its persistent workers.
//!
//! A persistent worker reads length-delimited [`WorkRequest`] messages from
//! its stdin and writes length-delimited [`WorkResponse`] messages to its
//! stdout. The message schema lives in `proto/worker_protocol.proto`; the
//! types here mirror it field for field.
//!
//! The [`delimited`] module implements the framing: a protobuf varint length
//! prefix followed by the encoded message.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod delimited;
mod messages;

pub use messages::{Input, WorkRequest, WorkResponse};
