//! HTTP admin endpoint.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::error::{Error, Result};

/// Path that triggers a graceful stop.
pub const STOP_PATH: &str = "/wirecall/stop";

/// Admin HTTP server. A request to [`STOP_PATH`] cancels `stop`.
pub(crate) struct AdminServer {
    local_addr: SocketAddr,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl AdminServer {
    pub(crate) async fn start(listen_addr: &str, stop: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|source| Error::AdminBind {
                addr: listen_addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| Error::AdminBind {
            addr: listen_addr.to_string(),
            source,
        })?;

        let router = Router::new()
            .route(STOP_PATH, get(request_stop).post(request_stop))
            .with_state(stop);

        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        let token = shutdown_token.clone();
        task_tracker.spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!("admin endpoint exited: {e}");
            }
        });
        task_tracker.close();

        info!(addr = %local_addr, "admin endpoint listening");

        Ok(Self {
            local_addr,
            shutdown_token,
            task_tracker,
        })
    }

    pub(crate) const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.wait().await;

        info!("admin endpoint shutdown");
    }
}

async fn request_stop(State(stop): State<CancellationToken>) -> &'static str {
    info!("stop requested through admin endpoint");
    stop.cancel();
    "ok"
}
