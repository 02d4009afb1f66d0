//! Payload codecs selected by the `content-type` metadata entry.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::{CodecError, Result};

/// Types a handler or caller can put in an envelope body.
///
/// Blanket-implemented for anything that is both a protobuf message and a
/// serde type, which is what generated stubs derive.
pub trait Payload: prost::Message + Default + Serialize + DeserializeOwned {}

impl<T> Payload for T where T: prost::Message + Default + Serialize + DeserializeOwned {}

/// Body serialization negotiated per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BodyCodec {
    /// JSON; also used when the content type is missing or unknown.
    #[default]
    Json,
    /// Protocol Buffers binary.
    Proto,
}

impl BodyCodec {
    /// Picks the codec for a `content-type` value.
    #[must_use]
    pub fn for_content_type(name: &str) -> Self {
        match name {
            "proto" | "protobuf" => Self::Proto,
            _ => Self::Json,
        }
    }

    /// Name sent in the `content-type` metadata entry.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Proto => "proto",
        }
    }

    /// Encode a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn marshal<T: Payload>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Json => serde_json::to_vec(value)
                .map_err(|e| CodecError::SerializationFailed(e.to_string()).into()),
            Self::Proto => Ok(value.encode_to_vec()),
        }
    }

    /// Decode a payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is invalid for this codec.
    pub fn unmarshal<T: Payload>(self, data: &[u8]) -> Result<T> {
        match self {
            Self::Json => serde_json::from_slice(data)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string()).into()),
            Self::Proto => T::decode(data).map_err(|e| CodecError::from(e).into()),
        }
    }
}
