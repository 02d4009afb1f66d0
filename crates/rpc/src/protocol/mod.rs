//! Protocol layer for the RPC runtime.
//!
//! This module contains the wire-level definitions:
//! - The request/response envelope
//! - Frame header layout and the stream codec
//! - Payload codecs negotiated per call

pub mod codec;
pub mod envelope;
pub mod framing;

pub use codec::{BodyCodec, Payload};
pub use envelope::Envelope;
pub use framing::{
    CompressType, ContentType, HEADER_SIZE, MAX_BODY_LEN, Message, MessageCodec, MessageType,
};
