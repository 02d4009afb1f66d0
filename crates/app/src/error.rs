use std::io;

use thiserror::Error;

/// Result type alias for application operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error from a registry backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while configuring or running an application.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ReadConfig {
        /// Path of the file.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// Configuration is not valid TOML or has the wrong shape.
    #[error("invalid config: {0}")]
    ParseConfig(#[from] toml::de::Error),

    /// No `[[server]]` block with this name.
    #[error("server {0} is not configured")]
    UnknownServer(String),

    /// A server with this name was already added.
    #[error("server {0} already added")]
    DuplicateServer(String),

    /// `run` was called more than once.
    #[error("application already started")]
    AlreadyStarted,

    /// The admin endpoint could not bind.
    #[error("failed to bind admin endpoint {addr}: {source}")]
    AdminBind {
        /// Configured address.
        addr: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A server was started twice.
    #[error("server {0} already started")]
    ServerStarted(String),

    /// A server stopped, or failed to bind, before it listened.
    #[error("server {0} is not listening")]
    NotListening(String),

    /// An HTTP server could not bind.
    #[error("failed to bind HTTP server {addr}: {source}")]
    HttpBind {
        /// Configured address.
        addr: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// An HTTP server stopped serving with an error.
    #[error("HTTP server {server} failed: {source}")]
    HttpServe {
        /// Server name.
        server: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A registry operation failed.
    #[error("registry error: {0}")]
    Registry(#[source] BoxError),

    /// RPC runtime error.
    #[error(transparent)]
    Rpc(#[from] wirecall_rpc::Error),
}
