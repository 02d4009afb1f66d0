use thiserror::Error;
use wirecall_discovery::DiscoveryError;

/// Errors returned by the HTTP route service client.
#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP request could not be sent or its body could not be read.
    #[error("route service request to {url} failed: {source}")]
    Request {
        /// Endpoint that was called.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The response body was not valid JSON.
    #[error("invalid route service response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The route service answered with a non-success code.
    #[error("route service rejected request ({code}): {msg}")]
    Rejected {
        /// Code returned by the service.
        code: i32,
        /// Message returned by the service.
        msg: String,
    },
}

impl DiscoveryError for Error {}
