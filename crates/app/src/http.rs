//! HTTP server kind: serves an axum router under a `[[server]]` block.

use std::any::Any;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{debug, error, info, warn};
use wirecall_rpc::{ServerConfig, ServerState};

use crate::error::{Error, Result};

/// HTTP server driven by the same lifecycle as RPC servers.
///
/// A handler that panics answers `500` and the server keeps serving.
pub struct HttpServer {
    config: ServerConfig,
    router: Router,
    state: watch::Sender<ServerState>,
    started: AtomicBool,
    shutdown_token: CancellationToken,
    abort_token: CancellationToken,
}

impl HttpServer {
    /// Creates a server for `router`.
    #[must_use]
    pub fn new(config: ServerConfig, router: Router) -> Self {
        Self {
            config,
            router: router.layer(CatchPanicLayer::custom(panic_response)),
            state: watch::Sender::new(ServerState::Created),
            started: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
            abort_token: CancellationToken::new(),
        }
    }

    /// Server name from its configuration.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Wait until the server is listening.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotListening`] if the server stopped, or failed to
    /// bind, before it listened.
    pub async fn ready(&self) -> Result<SocketAddr> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| *state != ServerState::Created)
            .await
            .map(|state| *state)
            .unwrap_or(ServerState::Stopped);

        match state {
            ServerState::Listening(addr) => Ok(addr),
            _ => Err(Error::NotListening(self.config.name.clone())),
        }
    }

    /// Bind, signal readiness and serve requests until drained.
    ///
    /// # Errors
    ///
    /// Returns an error if the server was already started, binding fails or
    /// serving fails.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::ServerStarted(self.config.name.clone()));
        }

        let listen_addr = self.config.listen_addr();
        let bound = match TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                self.state.send_replace(ServerState::Stopped);
                return Err(Error::HttpBind {
                    addr: listen_addr,
                    source,
                });
            }
        };

        let listening = self.state.send_if_modified(|state| {
            if *state == ServerState::Created {
                *state = ServerState::Listening(local_addr);
                true
            } else {
                false
            }
        });
        if !listening {
            debug!(server = %self.config.name, "stopped before listening");
            return Ok(());
        }

        info!(server = %self.config.name, addr = %local_addr, "HTTP server listening");

        let serve = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(self.shutdown_token.clone().cancelled_owned());
        let result = tokio::select! {
            result = serve.into_future() => result,
            () = self.abort_token.cancelled() => Ok(()),
        };

        self.state.send_replace(ServerState::Stopped);
        info!(server = %self.config.name, "HTTP server stopped");

        result.map_err(|source| Error::HttpServe {
            server: self.config.name.clone(),
            source,
        })
    }

    /// Stop accepting and give in-flight requests up to `grace` to finish,
    /// then close the remaining connections.
    pub async fn drain(&self, grace: Duration) {
        self.shutdown_token.cancel();

        let never_listened = self.state.send_if_modified(|state| {
            if *state == ServerState::Created {
                *state = ServerState::Stopped;
                true
            } else {
                false
            }
        });
        if never_listened {
            return;
        }

        let mut rx = self.state.subscribe();
        let timed_out = timeout(grace, rx.wait_for(|state| *state == ServerState::Stopped))
            .await
            .is_err();
        if timed_out {
            warn!(server = %self.config.name, "drain grace period elapsed");
            self.abort_token.cancel();
            let _ = rx.wait_for(|state| *state == ServerState::Stopped).await;
        }
    }

    /// Close every connection without waiting for in-flight requests.
    pub async fn stop(&self) {
        self.drain(Duration::ZERO).await;
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let reason = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("http handler panicked: {reason}");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("handler panicked: {reason}"),
    )
        .into_response()
}
