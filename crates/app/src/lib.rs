//! Process lifecycle for wirecall services.
//!
//! An [`Application`] is built from an [`AppConfig`] (usually a TOML file),
//! serves one or more named RPC services or HTTP routers, announces their
//! addresses to a registry and keeps the announcement alive. A stop request, from
//! [`Application::stop`], the admin endpoint at [`STOP_PATH`] or Ctrl-C,
//! withdraws the announcements, drains in-flight calls and closes every
//! server.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod admin;
mod application;
mod config;
mod error;
mod http;
mod registry;

pub use admin::STOP_PATH;
pub use application::Application;
pub use config::{AppConfig, RegistryConfig, RegistryKind};
pub use error::{BoxError, Error, Result};
pub use http::HttpServer;
pub use registry::{Announcer, SharedRegistry};
