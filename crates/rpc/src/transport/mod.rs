//! Transport layer: connections, pools, client and server.

pub mod client;
pub mod connection;
mod pending;
pub mod pool;
pub mod resolver;
pub mod server;

pub use client::{Client, ClientBuilder};
pub use connection::Connection;
pub use pool::ConnectionPool;
pub use resolver::{BoxError, RouteResolver};
pub use server::{Server, ServerState};
