//! Application context: owns servers, the registry and the stop trigger.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use wirecall_rpc::{ClientBuilder, Server, Service};

use crate::admin::AdminServer;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::http::HttpServer;
use crate::registry::{Announcer, SharedRegistry};

/// Lifecycle shared by every server kind.
#[async_trait]
trait Endpoint: Send + Sync {
    fn name(&self) -> &str;

    fn spawn_on(self: Arc<Self>, tasks: &TaskTracker) -> JoinHandle<Result<()>>;

    async fn ready(&self) -> Result<SocketAddr>;

    async fn drain(&self, grace: Duration);
}

#[async_trait]
impl Endpoint for Server {
    fn name(&self) -> &str {
        Self::name(self)
    }

    fn spawn_on(self: Arc<Self>, tasks: &TaskTracker) -> JoinHandle<Result<()>> {
        tasks.spawn(async move { Self::start(&self).await.map_err(Error::from) })
    }

    async fn ready(&self) -> Result<SocketAddr> {
        Ok(Self::ready(self).await?)
    }

    async fn drain(&self, grace: Duration) {
        Self::drain(self, grace).await;
    }
}

#[async_trait]
impl Endpoint for HttpServer {
    fn name(&self) -> &str {
        Self::name(self)
    }

    fn spawn_on(self: Arc<Self>, tasks: &TaskTracker) -> JoinHandle<Result<()>> {
        tasks.spawn(async move { Self::start(&self).await })
    }

    async fn ready(&self) -> Result<SocketAddr> {
        Self::ready(self).await
    }

    async fn drain(&self, grace: Duration) {
        Self::drain(self, grace).await;
    }
}

/// A server address as announced to the registry.
#[derive(Debug, Clone)]
struct Announcement {
    service: String,
    addr: String,
}

/// Owns the servers of one process and runs them until asked to stop.
///
/// RPC services and HTTP routers are added by name and pick up their `[[server]]` block from the
/// configuration. [`run`](Self::run) starts everything, announces the
/// servers, and on stop withdraws, drains and closes them in that order.
pub struct Application {
    config: AppConfig,
    servers: Vec<Arc<Server>>,
    http_servers: Vec<Arc<HttpServer>>,
    endpoints: Vec<Arc<dyn Endpoint>>,
    registry: Option<SharedRegistry>,
    stop: CancellationToken,
    admin_addr: watch::Sender<Option<SocketAddr>>,
    started: AtomicBool,
}

impl Application {
    /// Creates an application, building the registry the configuration names.
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        let registry = config.registry.as_ref().map(SharedRegistry::from_config);

        Self {
            config,
            servers: Vec::new(),
            http_servers: Vec::new(),
            endpoints: Vec::new(),
            registry,
            stop: CancellationToken::new(),
            admin_addr: watch::Sender::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Use `registry` instead of the configured one.
    #[must_use]
    pub fn with_registry(mut self, registry: SharedRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The configuration this application was built from.
    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The registry, if any.
    #[must_use]
    pub const fn registry(&self) -> Option<&SharedRegistry> {
        self.registry.as_ref()
    }

    /// Serve `service` on the server configured under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if no `[[server]]` block is called `name`, or a
    /// server with that name was already added.
    pub fn add_service<S: Service>(&mut self, name: &str, service: S) -> Result<Arc<Server>> {
        let server = Server::new(self.server_config(name)?, service);
        self.servers.push(Arc::clone(&server));
        self.endpoints.push(Arc::clone(&server) as Arc<dyn Endpoint>);
        Ok(server)
    }

    /// Serve `router` over HTTP on the server configured under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if no `[[server]]` block is called `name`, or a
    /// server with that name was already added.
    pub fn add_http(&mut self, name: &str, router: Router) -> Result<Arc<HttpServer>> {
        let server = Arc::new(HttpServer::new(self.server_config(name)?, router));
        self.http_servers.push(Arc::clone(&server));
        self.endpoints.push(Arc::clone(&server) as Arc<dyn Endpoint>);
        Ok(server)
    }

    fn server_config(&self, name: &str) -> Result<wirecall_rpc::ServerConfig> {
        if self.endpoints.iter().any(|server| server.name() == name) {
            return Err(Error::DuplicateServer(name.to_string()));
        }
        self.config
            .server(name)
            .cloned()
            .ok_or_else(|| Error::UnknownServer(name.to_string()))
    }

    /// RPC servers added so far.
    #[must_use]
    pub fn servers(&self) -> &[Arc<Server>] {
        &self.servers
    }

    /// HTTP servers added so far.
    #[must_use]
    pub fn http_servers(&self) -> &[Arc<HttpServer>] {
        &self.http_servers
    }

    /// Client builder for `service`, preconfigured with the `[client]` block
    /// and the registry.
    #[must_use]
    pub fn client(&self, service: impl Into<String>) -> ClientBuilder {
        let builder = ClientBuilder::new(service).config(self.config.client.clone());

        match &self.registry {
            Some(registry) => builder.discovery(registry.resolver()),
            None => builder,
        }
    }

    /// Ask a running application to stop.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Token cancelled when the application is asked to stop.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Address the admin endpoint listens on, once it is up.
    ///
    /// Returns `None` when no admin endpoint is configured or the
    /// application stopped first.
    pub async fn admin_addr(&self) -> Option<SocketAddr> {
        if self.config.admin_listen.is_none() {
            return None;
        }

        let mut rx = self.admin_addr.subscribe();
        tokio::select! {
            result = rx.wait_for(Option::is_some) => result.ok().and_then(|addr| *addr),
            () = self.stop.cancelled() => None,
        }
    }

    /// Start the admin endpoint and every server, announce the servers and
    /// keep them alive until a stop is requested through [`stop`](Self::stop),
    /// the admin endpoint, or Ctrl-C.
    ///
    /// # Errors
    ///
    /// Returns an error if the application already ran, the admin endpoint
    /// or a server fails to start, or a server cannot be announced. Servers
    /// already started are shut down before returning.
    pub async fn run(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let admin = match &self.config.admin_listen {
            Some(addr) => Some(AdminServer::start(addr, self.stop.clone()).await?),
            None => None,
        };
        if let Some(admin) = &admin {
            self.admin_addr.send_replace(Some(admin.local_addr()));
        }

        let tasks = TaskTracker::new();
        let mut announced = Vec::new();
        let result = self.serve(&tasks, &mut announced).await;

        self.stop.cancel();
        self.shutdown(&announced).await;

        tasks.close();
        tasks.wait().await;
        if let Some(admin) = admin {
            admin.shutdown().await;
        }

        info!(service = %self.config.service, "application stopped");
        result
    }

    async fn serve(&self, tasks: &TaskTracker, announced: &mut Vec<Announcement>) -> Result<()> {
        let handles: Vec<_> = self
            .endpoints
            .iter()
            .map(|server| Arc::clone(server).spawn_on(tasks))
            .collect();

        let mut listening = Vec::with_capacity(self.endpoints.len());
        for (server, handle) in self.endpoints.iter().zip(handles) {
            match server.ready().await {
                Ok(addr) => listening.push(Announcement {
                    service: server.name().to_string(),
                    addr: addr.to_string(),
                }),
                Err(not_ready) => {
                    error!(server = server.name(), "server failed to start");
                    return Err(match handle.await {
                        Ok(Err(e)) => e,
                        _ => not_ready,
                    });
                }
            }
        }

        if let Some(registry) = &self.registry {
            for announcement in listening {
                registry
                    .announcer()
                    .announce(&announcement.service, &announcement.addr)
                    .await
                    .map_err(Error::Registry)?;
                info!(service = %announcement.service, addr = %announcement.addr, "registered");
                announced.push(announcement);
            }

            tasks.spawn(keep_alive(
                Arc::clone(registry.announcer()),
                announced.clone(),
                self.config.keep_alive(),
                self.stop.clone(),
            ));
        }

        info!(service = %self.config.service, servers = self.endpoints.len(), "application running");

        tokio::select! {
            () = self.stop.cancelled() => {}
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("received interrupt signal"),
                Err(e) => {
                    warn!("failed to listen for interrupt signal: {e}");
                    self.stop.cancelled().await;
                }
            },
        }

        Ok(())
    }

    async fn shutdown(&self, announced: &[Announcement]) {
        info!(service = %self.config.service, "application shutting down...");

        if let Some(registry) = &self.registry {
            for announcement in announced {
                if let Err(e) = registry
                    .announcer()
                    .withdraw(&announcement.service, &announcement.addr)
                    .await
                {
                    warn!(service = %announcement.service, addr = %announcement.addr, "unregister failed: {e}");
                }
            }
        }

        let grace = self.config.drain_grace();
        join_all(self.endpoints.iter().map(|server| server.drain(grace))).await;
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("service", &self.config.service)
            .field("servers", &self.endpoints.len())
            .finish_non_exhaustive()
    }
}

async fn keep_alive(
    announcer: Arc<dyn Announcer>,
    announced: Vec<Announcement>,
    period: Duration,
    stop: CancellationToken,
) {
    if period.is_zero() || announced.is_empty() {
        return;
    }

    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        for announcement in &announced {
            if let Err(e) = announcer
                .refresh(&announcement.service, &announcement.addr)
                .await
            {
                warn!(service = %announcement.service, addr = %announcement.addr, "keep-alive failed: {e}");
            }
        }
    }

    debug!("keep-alive loop stopped");
}
