use thiserror::Error;
use wirecall_discovery::DiscoveryError;

/// Errors returned by the in-memory registry.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The registry was switched into the unavailable state.
    #[error("registry unavailable")]
    Unavailable,

    /// A keep-alive arrived for an address that was never registered.
    #[error("{addr} is not registered for {service}")]
    NotRegistered {
        /// Service name.
        service: String,
        /// Address that was refreshed.
        addr: String,
    },
}

impl DiscoveryError for Error {}
