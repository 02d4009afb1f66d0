//! Type-erased registry handle shared by servers and clients.

use std::sync::Arc;

use async_trait::async_trait;
use wirecall_discovery::{Discovery, Registry};
use wirecall_discovery_http::HttpRegistry;
use wirecall_discovery_memory::MemoryRegistry;
use wirecall_rpc::RouteResolver;

use crate::config::{RegistryConfig, RegistryKind};
use crate::error::BoxError;

/// Object-safe view of a [`Registry`].
#[async_trait]
pub trait Announcer: Send + Sync + 'static {
    /// Add `addr` under `service`.
    async fn announce(&self, service: &str, addr: &str) -> Result<(), BoxError>;

    /// Remove `addr` from `service`.
    async fn withdraw(&self, service: &str, addr: &str) -> Result<(), BoxError>;

    /// Refresh the entry for `addr`.
    async fn refresh(&self, service: &str, addr: &str) -> Result<(), BoxError>;
}

#[async_trait]
impl<R> Announcer for R
where
    R: Registry,
{
    async fn announce(&self, service: &str, addr: &str) -> Result<(), BoxError> {
        self.register(service, addr).await.map_err(Into::into)
    }

    async fn withdraw(&self, service: &str, addr: &str) -> Result<(), BoxError> {
        self.unregister(service, addr).await.map_err(Into::into)
    }

    async fn refresh(&self, service: &str, addr: &str) -> Result<(), BoxError> {
        self.keep_alive(service, addr).await.map_err(Into::into)
    }
}

/// One backend seen both as a write-side [`Announcer`] and a read-side
/// [`RouteResolver`].
#[derive(Clone)]
pub struct SharedRegistry {
    announcer: Arc<dyn Announcer>,
    resolver: Arc<dyn RouteResolver>,
}

impl SharedRegistry {
    /// Wrap a backend implementing both halves.
    pub fn new<R>(registry: R) -> Self
    where
        R: Discovery + Registry,
    {
        let registry = Arc::new(registry);
        Self {
            announcer: Arc::clone(&registry) as Arc<dyn Announcer>,
            resolver: registry,
        }
    }

    /// Backend selected by configuration.
    #[must_use]
    pub fn from_config(config: &RegistryConfig) -> Self {
        match config.kind {
            RegistryKind::Http => Self::new(HttpRegistry::new(config.host.clone())),
            RegistryKind::Memory => Self::new(MemoryRegistry::new()),
        }
    }

    /// Write side.
    #[must_use]
    pub fn announcer(&self) -> &Arc<dyn Announcer> {
        &self.announcer
    }

    /// Read side, suitable for
    /// [`ClientBuilder::discovery`](wirecall_rpc::ClientBuilder::discovery).
    #[must_use]
    pub fn resolver(&self) -> Arc<dyn RouteResolver> {
        Arc::clone(&self.resolver)
    }
}

impl std::fmt::Debug for SharedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegistry").finish_non_exhaustive()
    }
}
