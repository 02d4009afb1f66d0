//! Abstract interface for service discovery and registration.
//!
//! A [`Discovery`] resolves a service name to the addresses currently serving
//! it. A [`Registry`] is the write side: servers announce themselves on start,
//! refresh their entry periodically, and withdraw on shutdown.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for `Discovery` and `Registry` errors
pub trait DiscoveryError: Debug + Error + Send + Sync + 'static {}

/// Resolves service names to network addresses.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// The error type for route queries.
    type Error: DiscoveryError;

    /// Returns the addresses (`host:port`) currently registered for `service`.
    ///
    /// An empty list is a valid answer and means nobody is serving the name.
    async fn query_route(&self, service: &str) -> Result<Vec<String>, Self::Error>;
}

/// Announces and withdraws addresses for a service name.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// The error type for registry operations.
    type Error: DiscoveryError;

    /// Adds `addr` to the set of addresses serving `service`.
    async fn register(&self, service: &str, addr: &str) -> Result<(), Self::Error>;

    /// Removes `addr` from the set of addresses serving `service`.
    async fn unregister(&self, service: &str, addr: &str) -> Result<(), Self::Error>;

    /// Refreshes the registration of `addr` so it is not expired.
    async fn keep_alive(&self, service: &str, addr: &str) -> Result<(), Self::Error>;
}
