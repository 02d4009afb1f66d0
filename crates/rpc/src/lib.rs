//! Lightweight RPC transport for named services over TCP.
//!
//! A compact binary framing carries a request/response envelope. Clients keep
//! a pool of persistent connections per host, correlate responses to callers
//! by request id and can follow a discovery backend. Servers bound concurrent
//! handler runs, enforce an invocation deadline and contain handler panics.
//!
//! # Example
//!
//! ```no_run
//! use wirecall_rpc::{BodyCodec, CallContext, Client, MethodRouter, Server, ServerConfig};
//!
//! struct Echo;
//!
//! async fn example() -> wirecall_rpc::Result<()> {
//!     let router = MethodRouter::new(Echo).raw("Echo", |_echo, _ctx, _codec, body| async move {
//!         wirecall_rpc::Result::Ok(body)
//!     });
//!     let server = Server::new(ServerConfig::new("echo", "127.0.0.1", 7000), router);
//!     tokio::spawn({
//!         let server = server.clone();
//!         async move { server.start().await }
//!     });
//!     let addr = server.ready().await?;
//!
//!     let client = Client::builder("echo").hosts([addr.to_string()]).build().await;
//!     let out = client
//!         .call(&CallContext::new(), None, BodyCodec::Json, "Echo", b"hi".to_vec())
//!         .await?;
//!     assert_eq!(out, b"hi");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod error;
pub mod message_pool;
pub mod protocol;
pub mod service;
pub mod trace;
pub mod transport;

// Re-export commonly used types
pub use config::{ClientConfig, ServerConfig};
pub use context::{CallContext, metadata_key};
pub use error::{CodecError, ConnectionError, Error, ProtocolError, Result, code};
pub use message_pool::{MessagePool, PooledMessage};
pub use protocol::{BodyCodec, CompressType, ContentType, Envelope, Payload};
pub use service::{MethodRouter, Service};
pub use trace::Trace;
pub use transport::{
    Client, ClientBuilder, Connection, ConnectionPool, RouteResolver, Server, ServerState,
};
