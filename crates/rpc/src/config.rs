//! Static client and server parameters.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;
const DEFAULT_REFRESH_ENDPOINT_INTERVAL_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 3000;
const DEFAULT_MAX_INVOKE: usize = 10_000;

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-call timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Interval between discovery refreshes in milliseconds
    pub refresh_endpoint_interval_ms: u64,

    /// Connections per host; defaults to the number of CPUs
    pub pool_size: Option<usize>,

    /// Dial timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            refresh_endpoint_interval_ms: DEFAULT_REFRESH_ENDPOINT_INTERVAL_MS,
            pool_size: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    /// Per-call timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Interval between discovery refreshes.
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_endpoint_interval_ms)
    }

    /// Dial timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Connections kept per host.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size.filter(|n| *n > 0).unwrap_or_else(num_cpus::get)
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Service object name
    pub name: String,

    /// Listen IP
    pub ip: String,

    /// Listen port; 0 picks a free port
    pub port: u16,

    /// Invocation timeout in milliseconds; 0 disables it
    pub invoke_timeout_ms: u64,

    /// Maximum concurrent invocations
    pub max_invoke: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            ip: "0.0.0.0".to_string(),
            port: 0,
            invoke_timeout_ms: 0,
            max_invoke: DEFAULT_MAX_INVOKE,
        }
    }
}

impl ServerConfig {
    /// Config for `name` listening on `ip:port`.
    #[must_use]
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
            ..Self::default()
        }
    }

    /// `ip:port` to bind.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Invocation timeout, if enabled.
    #[must_use]
    pub const fn invoke_timeout(&self) -> Option<Duration> {
        if self.invoke_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.invoke_timeout_ms))
        }
    }

    /// Admission gate capacity, between one and the semaphore permit limit.
    #[must_use]
    pub fn max_invoke(&self) -> usize {
        self.max_invoke.clamp(1, Semaphore::MAX_PERMITS)
    }
}
