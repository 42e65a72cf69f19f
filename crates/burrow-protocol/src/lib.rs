//! Burrow wire protocol: message model and codec.
//!
//! Every datagram is a textual header followed by an optional binary body:
//!
//! ```text
//! <version> <KIND> <sender> <fileId> [chunkNo] [replicationDegree]\r\n\r\n[body]
//! ```
//!
//! The body has no framing of its own; its length is whatever remains in the
//! datagram after the double line terminator. An empty body is valid and
//! meaningful for PUTCHUNK and CHUNK.

pub mod error;
pub mod message;

pub use error::ProtocolError;
pub use message::{chunk_id, Message, MessageKind, HEADER_TERMINATOR};
