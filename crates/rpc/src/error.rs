//! Error types for the RPC runtime.

use std::io;

use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result codes reserved by the runtime on the wire.
pub mod code {
    /// The call did not complete before its deadline.
    pub const TIMEOUT: i32 = 9999;
    /// The handler failed without a structured code, or panicked.
    pub const INTERNAL: i32 = 9998;
    /// The service has no method with the requested name.
    pub const METHOD_NOT_FOUND: i32 = 9997;
}

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-related errors.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Protocol-level errors.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec errors during serialization/deserialization.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Non-zero result code produced by the remote handler.
    #[error("Remote error {code}: {desc}")]
    Application {
        /// Result code.
        code: i32,
        /// Human-readable description.
        desc: String,
    },

    /// Call or invocation deadline elapsed.
    #[error("request timeout")]
    Timeout,

    /// `start` called on a server that already started or stopped.
    #[error("server {0} already started")]
    AlreadyStarted(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Connection-specific errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Failed to establish connection.
    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        addr: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Connection closed, by either side.
    #[error("Connection closed")]
    Closed,

    /// A pooled connection turned out to be unusable.
    #[error("bad connection")]
    BadConnection,

    /// No usable connection to the requested destination.
    #[error("not found connection")]
    NotFound,

    /// The owner of the connection is shutting down.
    #[error("Connection is shutting down")]
    ShuttingDown,
}

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Content type nibble names no known codec.
    #[error("not support content type: {0:#x}")]
    UnsupportedContentType(u8),

    /// Message type nibble names no known message type.
    #[error("unknown message type: {0:#x}")]
    UnknownMessageType(u8),

    /// Compression nibble names no known compression.
    #[error("unknown compress type: {0:#x}")]
    UnknownCompressType(u8),

    /// Body exceeds what the length prefix can describe.
    #[error("full body length: {size} exceeds maximum {max}")]
    FullBodyLength {
        /// Size of the body.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Codec-related errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),
}

impl Error {
    /// Creates an application error carrying `code` and `desc`.
    pub fn application(code: i32, desc: impl Into<String>) -> Self {
        Self::Application {
            code,
            desc: desc.into(),
        }
    }

    /// Wire result code for this error.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Application { code, .. } => *code,
            Self::Timeout => code::TIMEOUT,
            _ => code::INTERNAL,
        }
    }

    /// Wire result description for this error.
    #[must_use]
    pub fn desc(&self) -> String {
        match self {
            Self::Application { desc, .. } => desc.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this is a deadline error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Whether the connection this error came from can no longer be used.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::Connection(ConnectionError::Closed | ConnectionError::ShuttingDown)
        )
    }

    pub(crate) const fn is_bad_connection(&self) -> bool {
        matches!(self, Self::Connection(ConnectionError::BadConnection))
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<prost::DecodeError> for CodecError {
    fn from(err: prost::DecodeError) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<prost::EncodeError> for CodecError {
    fn from(err: prost::EncodeError) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}
