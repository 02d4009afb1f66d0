//! Application configuration file.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wirecall_rpc::{ClientConfig, ServerConfig};

use crate::error::{Error, Result};

const DEFAULT_KEEP_ALIVE_MS: u64 = 10_000;
const DEFAULT_DRAIN_GRACE_MS: u64 = 1000;

/// Top-level configuration of an [`Application`](crate::Application).
///
/// ```toml
/// service = "greeter"
/// admin_listen = "127.0.0.1:9090"
///
/// [[server]]
/// name = "Greeter"
/// ip = "0.0.0.0"
/// port = 7000
///
/// [client]
/// request_timeout_ms = 3000
///
/// [registry]
/// kind = "http"
/// host = "127.0.0.1:8500"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name the application's servers are registered under
    pub service: String,

    /// Address of the admin HTTP endpoint; disabled when absent
    pub admin_listen: Option<String>,

    /// Registry keep-alive period in milliseconds
    pub keep_alive_ms: u64,

    /// How long in-flight invocations may run after a stop request
    pub drain_grace_ms: u64,

    /// One block per server
    pub server: Vec<ServerConfig>,

    /// Defaults for clients created through the application
    pub client: ClientConfig,

    /// Service registry backend
    pub registry: Option<RegistryConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service: String::new(),
            admin_listen: None,
            keep_alive_ms: DEFAULT_KEEP_ALIVE_MS,
            drain_grace_ms: DEFAULT_DRAIN_GRACE_MS,
            server: Vec::new(),
            client: ClientConfig::default(),
            registry: None,
        }
    }
}

impl AppConfig {
    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::ReadConfig {
            path: path.display().to_string(),
            source,
        })?;
        text.parse()
    }

    /// Configuration of the server called `name`.
    #[must_use]
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.server.iter().find(|server| server.name == name)
    }

    /// Registry keep-alive period.
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Drain grace period.
    #[must_use]
    pub const fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

impl FromStr for AppConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

/// Which registry implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    /// Remote route service over HTTP
    Http,
    /// Process-local table
    Memory,
}

/// Service registry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Backend kind
    pub kind: RegistryKind,

    /// Route service address (`ip:port`), used by the HTTP backend
    #[serde(default)]
    pub host: String,
}
