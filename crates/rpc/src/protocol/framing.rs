//! Message framing for the wire protocol.
//!
//! Every frame is a fixed six byte header followed by the serialized
//! envelope:
//!
//! ```text
//! [len0 len1 len2 len3][type:4 | content:4][compress:4 | reserved:4][body ...]
//! ```
//!
//! The body length is little-endian. A ping frame has an empty body.

use std::borrow::Cow;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use prost::Message as _;
use tokio_util::codec::{Decoder, Encoder};

use super::envelope::Envelope;
use crate::error::{CodecError, Error, ProtocolError, Result};
use crate::message_pool::{MessagePool, PooledMessage};

/// Frame header size.
pub const HEADER_SIZE: usize = 6;

/// Largest body the length prefix may announce.
pub const MAX_BODY_LEN: usize = (1 << 31) - 1 - HEADER_SIZE;

const LOW_NIBBLE: u8 = 0x0F;

/// Kind of frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Liveness probe with an empty body; never reaches a handler.
    Ping = 0x1,
    /// Request or response carrying an envelope.
    #[default]
    Data = 0x2,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0x1 => Ok(Self::Ping),
            0x2 => Ok(Self::Data),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Serialization used for the envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    /// JSON.
    #[default]
    Json = 0x1,
    /// Protocol Buffers binary.
    Proto = 0x2,
}

impl TryFrom<u8> for ContentType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0x1 => Ok(Self::Json),
            0x2 => Ok(Self::Proto),
            _ => Err(ProtocolError::UnsupportedContentType(value)),
        }
    }
}

/// Compression applied to the serialized envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressType {
    /// Body sent as serialized.
    #[default]
    None = 0x0,
    /// Body gzip-compressed after serialization.
    Gzip = 0x1,
}

impl TryFrom<u8> for CompressType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0x0 => Ok(Self::None),
            0x1 => Ok(Self::Gzip),
            _ => Err(ProtocolError::UnknownCompressType(value)),
        }
    }
}

/// One frame's worth of data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Body length as read off the wire; zero for locally built messages.
    pub body_len: u32,
    /// Frame kind.
    pub message_type: MessageType,
    /// Envelope serialization.
    pub content_type: ContentType,
    /// Body compression.
    pub compress_type: CompressType,
    /// Payload; empty for pings.
    pub envelope: Envelope,
}

impl Message {
    /// Restores the message to its default state, keeping allocations.
    pub fn reset(&mut self) {
        self.body_len = 0;
        self.message_type = MessageType::default();
        self.content_type = ContentType::default();
        self.compress_type = CompressType::default();
        self.envelope.reset();
    }

    fn encode_body(&self) -> Result<Vec<u8>> {
        if self.message_type == MessageType::Ping {
            return Ok(Vec::new());
        }

        let serialized = match self.content_type {
            ContentType::Json => serde_json::to_vec(&self.envelope)
                .map_err(|e| CodecError::SerializationFailed(e.to_string()))?,
            ContentType::Proto => self.envelope.encode_to_vec(),
        };

        match self.compress_type {
            CompressType::None => Ok(serialized),
            CompressType::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&serialized)?;
                Ok(encoder.finish()?)
            }
        }
    }
}

fn decode_envelope(content_type: ContentType, raw: &[u8], envelope: &mut Envelope) -> Result<()> {
    match content_type {
        ContentType::Json => {
            let decoded: Envelope = serde_json::from_slice(raw).map_err(CodecError::from)?;
            envelope.absorb(decoded);
        }
        ContentType::Proto => {
            envelope.merge(raw).map_err(CodecError::from)?;
        }
    }
    Ok(())
}

/// Codec turning byte streams into pooled [`Message`]s and back.
pub struct MessageCodec {
    pool: Arc<MessagePool>,
    max_body_len: usize,
}

impl MessageCodec {
    /// Create a new codec drawing decoded messages from `pool`.
    #[must_use]
    pub const fn new(pool: Arc<MessagePool>) -> Self {
        Self {
            pool,
            max_body_len: MAX_BODY_LEN,
        }
    }

    /// Create a codec with a smaller maximum body size.
    #[must_use]
    pub const fn with_max_body_len(mut self, size: usize) -> Self {
        self.max_body_len = if size < MAX_BODY_LEN {
            size
        } else {
            MAX_BODY_LEN
        };
        self
    }
}

impl Decoder for MessageCodec {
    type Item = PooledMessage;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let type_bits = buf[4] >> 4;
        let content_bits = buf[4] & LOW_NIBBLE;
        let compress_bits = buf[5] >> 4;

        if body_len > self.max_body_len {
            return Err(ProtocolError::FullBodyLength {
                size: body_len,
                max: self.max_body_len,
            }
            .into());
        }

        let frame_len = HEADER_SIZE + body_len;
        if buf.len() < frame_len {
            // Grow only as far as the pending frame needs
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        // The whole frame is consumed before validation so a rejected frame
        // never leaves a partial body behind
        buf.advance(HEADER_SIZE);
        let body = buf.split_to(body_len);

        let message_type = MessageType::try_from(type_bits)?;
        let compress_type = CompressType::try_from(compress_bits)?;

        let mut message = self.pool.acquire();
        #[allow(clippy::cast_possible_truncation)]
        {
            message.body_len = body_len as u32;
        }
        message.message_type = message_type;
        message.compress_type = compress_type;

        if body_len == 0 {
            message.content_type = ContentType::try_from(content_bits).unwrap_or_default();
            return Ok(Some(message));
        }

        let content_type = ContentType::try_from(content_bits)?;
        message.content_type = content_type;

        let raw: Cow<'_, [u8]> = match compress_type {
            CompressType::None => Cow::Borrowed(&body[..]),
            CompressType::Gzip => {
                let limit = u64::try_from(self.max_body_len).unwrap_or(u64::MAX);
                let mut inflated = Vec::with_capacity(body_len);
                GzDecoder::new(&body[..])
                    .take(limit.saturating_add(1))
                    .read_to_end(&mut inflated)?;
                if inflated.len() > self.max_body_len {
                    return Err(ProtocolError::FullBodyLength {
                        size: inflated.len(),
                        max: self.max_body_len,
                    }
                    .into());
                }
                Cow::Owned(inflated)
            }
        };

        decode_envelope(content_type, &raw, &mut message.envelope)?;

        Ok(Some(message))
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let body = message.encode_body()?;

        if body.len() > self.max_body_len {
            return Err(ProtocolError::FullBodyLength {
                size: body.len(),
                max: self.max_body_len,
            }
            .into());
        }

        dst.reserve(HEADER_SIZE + body.len());

        #[allow(clippy::cast_possible_truncation)]
        dst.put_u32_le(body.len() as u32);
        dst.put_u8((message.message_type as u8) << 4 | (message.content_type as u8 & LOW_NIBBLE));
        dst.put_u8((message.compress_type as u8) << 4);
        dst.put_slice(&body);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn codec() -> MessageCodec {
        MessageCodec::new(MessagePool::new(16))
    }

    fn data_message(content_type: ContentType, envelope: Envelope) -> Message {
        Message {
            body_len: 0,
            message_type: MessageType::Data,
            content_type,
            compress_type: CompressType::None,
            envelope,
        }
    }

    fn request_envelope() -> Envelope {
        Envelope {
            request_id: 11,
            object_name: "greeter".to_string(),
            method: "SayHello".to_string(),
            metadata: HashMap::from([("trace-id".to_string(), "abc".to_string())]),
            body: vec![1, 2, 3],
            code: 0,
            desc: String::new(),
        }
    }

    #[test]
    fn test_header_layout() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        let message = data_message(ContentType::Proto, request_envelope());

        codec.encode(&message, &mut buf).unwrap();

        let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(body_len, buf.len() - HEADER_SIZE);
        assert_eq!(buf[4], 0x22);
        assert_eq!(buf[5], 0x00);
    }

    #[test]
    fn test_ping_has_empty_body() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        let ping = Message {
            message_type: MessageType::Ping,
            ..Message::default()
        };

        codec.encode(&ping, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0, 0x11, 0x00]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.message_type, MessageType::Ping);
        assert_eq!(decoded.envelope, Envelope::default());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = codec();
        let mut full = BytesMut::new();
        codec
            .encode(&data_message(ContentType::Json, request_envelope()), &mut full)
            .unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[3..full.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[full.len() - 1..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.envelope, request_envelope());
    }

    #[test]
    fn test_unsupported_content_type_discards_frame() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        buf.put_u8(0x27);
        buf.put_u8(0x00);
        buf.put_slice(b"abc");

        assert_matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::UnsupportedContentType(0x7)))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_message_type() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        buf.put_u32_le(0);
        buf.put_u8(0x51);
        buf.put_u8(0x00);

        assert_matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::UnknownMessageType(0x5)))
        );
    }

    #[test]
    fn test_body_too_large() {
        let mut codec = codec().with_max_body_len(8);
        let mut buf = BytesMut::new();

        assert_matches!(
            codec.encode(&data_message(ContentType::Json, request_envelope()), &mut buf),
            Err(Error::Protocol(ProtocolError::FullBodyLength { max: 8, .. }))
        );

        let mut buf = BytesMut::new();
        buf.put_u32_le(64);
        buf.put_u8(0x21);
        buf.put_u8(0x00);
        assert_matches!(
            codec.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::FullBodyLength { size: 64, .. }))
        );
    }

    #[test]
    fn test_gzip_body() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        let mut envelope = request_envelope();
        envelope.body = vec![b'a'; 4096];
        let message = Message {
            compress_type: CompressType::Gzip,
            ..data_message(ContentType::Json, envelope.clone())
        };

        codec.encode(&message, &mut buf).unwrap();
        assert!(buf.len() < 4096);
        assert_eq!(buf[5], 0x10);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.compress_type, CompressType::Gzip);
        assert_eq!(decoded.envelope, envelope);
    }

    #[test]
    fn test_gzip_inflation_is_bounded() {
        let mut envelope = request_envelope();
        envelope.body = vec![0; 1 << 20];
        let message = Message {
            compress_type: CompressType::Gzip,
            ..data_message(ContentType::Proto, envelope)
        };

        let mut buf = BytesMut::new();
        codec().encode(&message, &mut buf).unwrap();
        assert!(buf.len() < 16 * 1024);

        let mut small = codec().with_max_body_len(16 * 1024);
        assert_matches!(
            small.decode(&mut buf),
            Err(Error::Protocol(ProtocolError::FullBodyLength { max, .. })) if max == 16 * 1024
        );
    }

    #[test]
    fn test_json_decode_keeps_envelope_capacity() {
        let mut envelope = request_envelope();
        envelope.body = Vec::with_capacity(4096);
        envelope.desc = String::with_capacity(256);
        let body_capacity = envelope.body.capacity();
        let desc_capacity = envelope.desc.capacity();

        let raw = serde_json::to_vec(&request_envelope()).unwrap();
        decode_envelope(ContentType::Json, &raw, &mut envelope).unwrap();

        assert_eq!(envelope, request_envelope());
        assert!(envelope.body.capacity() >= body_capacity);
        assert!(envelope.desc.capacity() >= desc_capacity);
    }

    #[test]
    fn test_consecutive_frames() {
        let mut codec = codec();
        let mut buf = BytesMut::new();
        for id in 1..=3 {
            let mut envelope = request_envelope();
            envelope.request_id = id;
            codec
                .encode(&data_message(ContentType::Proto, envelope), &mut buf)
                .unwrap();
        }

        for id in 1..=3 {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.envelope.request_id, id);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    fn arb_envelope() -> impl Strategy<Value = Envelope> {
        (
            any::<u32>(),
            ".{0,16}",
            ".{0,16}",
            prop::collection::hash_map(".{0,8}", ".{0,8}", 0..4),
            prop::collection::vec(any::<u8>(), 0..64),
            any::<i32>(),
            ".{0,16}",
        )
            .prop_map(
                |(request_id, object_name, method, metadata, body, code, desc)| Envelope {
                    request_id,
                    object_name,
                    method,
                    metadata,
                    body,
                    code,
                    desc,
                },
            )
    }

    proptest! {
        #[test]
        fn prop_envelope_survives_both_codecs(envelope in arb_envelope()) {
            for content_type in [ContentType::Json, ContentType::Proto] {
                let mut codec = codec();
                let mut buf = BytesMut::new();
                codec.encode(&data_message(content_type, envelope.clone()), &mut buf).unwrap();

                let decoded = codec.decode(&mut buf).unwrap().unwrap();
                prop_assert_eq!(&decoded.envelope, &envelope);
                prop_assert_eq!(decoded.content_type, content_type);
            }
        }
    }
}
