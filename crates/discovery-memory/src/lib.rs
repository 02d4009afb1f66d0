//! In-memory (single process) discovery and registry for tests and local runs.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;
use wirecall_discovery::{Discovery, Registry};

#[derive(Debug, Default)]
struct Entry {
    addrs: Vec<String>,
    last_seen: HashMap<String, Instant>,
}

/// In-memory route table implementing both [`Discovery`] and [`Registry`].
///
/// Clones share the same table, so one handle can be given to servers and
/// another to clients.
#[derive(Clone, Debug, Default)]
pub struct MemoryRegistry {
    routes: Arc<RwLock<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryRegistry {
    /// Creates a new instance of `MemoryRegistry`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the address list of `service` wholesale.
    pub fn set_routes<I, S>(&self, service: &str, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut routes = self.routes.write();
        let entry = routes.entry(service.to_string()).or_default();
        entry.addrs.clear();
        entry.last_seen.clear();
        for addr in addrs {
            let addr = addr.into();
            if !entry.addrs.contains(&addr) {
                entry.last_seen.insert(addr.clone(), Instant::now());
                entry.addrs.push(addr);
            }
        }
    }

    /// Makes every subsequent operation fail with [`Error::Unavailable`]
    /// until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns when `addr` last registered or sent a keep-alive.
    #[must_use]
    pub fn last_seen(&self, service: &str, addr: &str) -> Option<Instant> {
        self.routes
            .read()
            .get(service)
            .and_then(|entry| entry.last_seen.get(addr).copied())
    }

    fn check_available(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Discovery for MemoryRegistry {
    type Error = Error;

    async fn query_route(&self, service: &str) -> Result<Vec<String>, Self::Error> {
        self.check_available()?;

        Ok(self
            .routes
            .read()
            .get(service)
            .map(|entry| entry.addrs.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    type Error = Error;

    async fn register(&self, service: &str, addr: &str) -> Result<(), Self::Error> {
        self.check_available()?;

        let mut routes = self.routes.write();
        let entry = routes.entry(service.to_string()).or_default();
        if !entry.addrs.iter().any(|a| a == addr) {
            entry.addrs.push(addr.to_string());
        }
        entry.last_seen.insert(addr.to_string(), Instant::now());
        debug!(service, addr, "registered");

        Ok(())
    }

    async fn unregister(&self, service: &str, addr: &str) -> Result<(), Self::Error> {
        self.check_available()?;

        if let Some(entry) = self.routes.write().get_mut(service) {
            entry.addrs.retain(|a| a != addr);
            entry.last_seen.remove(addr);
        }
        debug!(service, addr, "unregistered");

        Ok(())
    }

    async fn keep_alive(&self, service: &str, addr: &str) -> Result<(), Self::Error> {
        self.check_available()?;

        let mut routes = self.routes.write();
        match routes.get_mut(service).and_then(|e| e.last_seen.get_mut(addr)) {
            Some(seen) => {
                *seen = Instant::now();
                Ok(())
            }
            None => Err(Error::NotRegistered {
                service: service.to_string(),
                addr: addr.to_string(),
            }),
        }
    }
}
