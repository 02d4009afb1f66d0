//! Discovery and registry backed by an HTTP route service.
//!
//! The route service exposes four JSON endpoints under `/micro/route/`:
//! `query`, `register`, `unregister` and `keepalive`. Every response carries a
//! `code` (200 on success) and a `msg`; `query` additionally returns `routes`.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use wirecall_discovery::{Discovery, Registry};

const SUCCESS_CODE: i32 = 200;

#[derive(Serialize)]
struct RouteRequest<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    addr: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RouteResponse {
    code: i32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    routes: Vec<Route>,
}

#[derive(Debug, Deserialize)]
struct Route {
    addr: String,
}

/// Client for a route service reachable at `host` (`ip:port`).
#[derive(Clone, Debug)]
pub struct HttpRegistry {
    client: Client,
    host: String,
}

impl HttpRegistry {
    /// Creates a new `HttpRegistry` talking to the route service at `host`.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            host: host.into(),
        }
    }

    async fn request(&self, action: &str, body: &RouteRequest<'_>) -> Result<RouteResponse, Error> {
        let url = format!("http://{}/micro/route/{action}", self.host);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|source| Error::Request {
                url: url.clone(),
                source,
            })?;
        let text = response.text().await.map_err(|source| Error::Request {
            url: url.clone(),
            source,
        })?;

        let parsed: RouteResponse = serde_json::from_str(&text).inspect_err(|e| {
            error!(url = %url, body = %text, "failed to decode route service response: {e}");
        })?;

        if parsed.code != SUCCESS_CODE {
            error!(url = %url, code = parsed.code, msg = %parsed.msg, "route service rejected request");
            return Err(Error::Rejected {
                code: parsed.code,
                msg: parsed.msg,
            });
        }

        Ok(parsed)
    }
}

#[async_trait]
impl Discovery for HttpRegistry {
    type Error = Error;

    async fn query_route(&self, service: &str) -> Result<Vec<String>, Self::Error> {
        let response = self
            .request(
                "query",
                &RouteRequest {
                    name: service,
                    addr: None,
                },
            )
            .await?;

        let routes: Vec<String> = response.routes.into_iter().map(|r| r.addr).collect();
        debug!(service, ?routes, "resolved routes");

        Ok(routes)
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    type Error = Error;

    async fn register(&self, service: &str, addr: &str) -> Result<(), Self::Error> {
        self.request(
            "register",
            &RouteRequest {
                name: service,
                addr: Some(addr),
            },
        )
        .await
        .map(|_| ())
    }

    async fn unregister(&self, service: &str, addr: &str) -> Result<(), Self::Error> {
        self.request(
            "unregister",
            &RouteRequest {
                name: service,
                addr: Some(addr),
            },
        )
        .await
        .map(|_| ())
    }

    async fn keep_alive(&self, service: &str, addr: &str) -> Result<(), Self::Error> {
        self.request(
            "keepalive",
            &RouteRequest {
                name: service,
                addr: Some(addr),
            },
        )
        .await
        .map(|_| ())
    }
}
