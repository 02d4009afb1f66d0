//! Host resolver feed: keeps a client's host list in sync with discovery.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wirecall_discovery::Discovery;

use super::client::ClientInner;

/// Boxed error returned by a [`RouteResolver`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Object-safe view of a [`Discovery`] backend.
///
/// Implemented for every `Discovery`, so any backend can be handed to a
/// client as `Arc<dyn RouteResolver>`.
#[async_trait]
pub trait RouteResolver: Send + Sync + 'static {
    /// Current addresses of `service`.
    async fn resolve(&self, service: &str) -> Result<Vec<String>, BoxError>;
}

#[async_trait]
impl<D> RouteResolver for D
where
    D: Discovery,
{
    async fn resolve(&self, service: &str) -> Result<Vec<String>, BoxError> {
        self.query_route(service).await.map_err(Into::into)
    }
}

/// Refresh the host list every `period` until `shutdown` fires or the
/// client is dropped. The first pass runs in the client builder.
pub(crate) async fn run_feed(
    client: Weak<ClientInner>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(client) = client.upgrade() else {
            break;
        };
        client.refresh().await;
    }

    debug!("host resolver feed stopped");
}
