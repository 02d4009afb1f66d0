//! RPC client implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::pending::PendingRequests;
use super::pool::ConnectionPool;
use super::resolver::{self, RouteResolver};
use crate::config::ClientConfig;
use crate::context::{CallContext, metadata_key};
use crate::error::{ConnectionError, Error, Result, code};
use crate::message_pool::MessagePool;
use crate::protocol::{BodyCodec, CompressType, ContentType, MessageType, Payload};

/// Builder for creating RPC clients.
pub struct ClientBuilder {
    name: String,
    config: ClientConfig,
    hosts: Vec<String>,
    resolver: Option<Arc<dyn RouteResolver>>,
    wire_format: ContentType,
    compression: CompressType,
    message_pool: Option<Arc<MessagePool>>,
}

impl ClientBuilder {
    /// Create a new client builder for the service `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ClientConfig::default(),
            hosts: Vec::new(),
            resolver: None,
            wire_format: ContentType::Json,
            compression: CompressType::None,
            message_pool: None,
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Add static hosts (`ip:port`). Duplicates are ignored.
    #[must_use]
    pub fn hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for host in hosts {
            let host = host.into();
            if !self.hosts.contains(&host) {
                self.hosts.push(host);
            }
        }
        self
    }

    /// Keep the host list in sync with a discovery backend.
    #[must_use]
    pub fn discovery(mut self, resolver: Arc<dyn RouteResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the default request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the number of connections per host.
    #[must_use]
    pub const fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = Some(size);
        self
    }

    /// Set the envelope serialization used on the wire.
    #[must_use]
    pub const fn wire_format(mut self, content_type: ContentType) -> Self {
        self.wire_format = content_type;
        self
    }

    /// Compress outgoing envelopes.
    #[must_use]
    pub const fn compression(mut self, compression: CompressType) -> Self {
        self.compression = compression;
        self
    }

    /// Share a message pool with other clients or servers.
    #[must_use]
    pub fn message_pool(mut self, pool: Arc<MessagePool>) -> Self {
        self.message_pool = Some(pool);
        self
    }

    /// Build the client.
    ///
    /// With a discovery backend the host list is resolved once before this
    /// returns, then refreshed in the background.
    pub async fn build(self) -> Client {
        let mut table = HostTable::default();
        table.hosts = self.hosts;

        let inner = Arc::new(ClientInner {
            name: self.name,
            config: self.config,
            wire_format: self.wire_format,
            compression: self.compression,
            hosts: Mutex::new(table),
            resolver: self.resolver,
            pending: Arc::new(PendingRequests::default()),
            message_pool: self.message_pool.unwrap_or_default(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        if inner.resolver.is_some() {
            inner.refresh().await;

            let period = inner.config.refresh_interval();
            if !period.is_zero() {
                inner.tasks.spawn(resolver::run_feed(
                    Arc::downgrade(&inner),
                    period,
                    inner.shutdown.clone(),
                ));
            }
        }

        Client { inner }
    }
}

#[derive(Default)]
struct HostTable {
    hosts: Vec<String>,
    pools: HashMap<String, Arc<ConnectionPool>>,
    cursor: usize,
}

impl HostTable {
    /// Install a freshly resolved list and return the pools of hosts that
    /// disappeared. Surviving hosts keep their position and their pool.
    fn replace(&mut self, resolved: Vec<String>) -> Vec<Arc<ConnectionPool>> {
        let wanted: HashSet<&str> = resolved.iter().map(String::as_str).collect();

        let mut next: Vec<String> = self
            .hosts
            .iter()
            .filter(|host| wanted.contains(host.as_str()))
            .cloned()
            .collect();
        for host in &resolved {
            if !next.contains(host) {
                next.push(host.clone());
            }
        }

        let gone: Vec<String> = self
            .pools
            .keys()
            .filter(|host| !next.contains(host))
            .cloned()
            .collect();
        let removed = gone
            .iter()
            .filter_map(|host| self.pools.remove(host))
            .collect();

        self.hosts = next;
        removed
    }

    fn next_host(&mut self) -> Option<String> {
        if self.hosts.is_empty() {
            return None;
        }
        if self.cursor >= self.hosts.len() {
            self.cursor = 0;
        }
        let host = self.hosts.get(self.cursor).cloned();
        self.cursor += 1;
        host
    }
}

pub(crate) struct ClientInner {
    name: String,
    config: ClientConfig,
    wire_format: ContentType,
    compression: CompressType,
    hosts: Mutex<HostTable>,
    resolver: Option<Arc<dyn RouteResolver>>,
    pending: Arc<PendingRequests>,
    message_pool: Arc<MessagePool>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ClientInner {
    fn pick_pool(&self, host: Option<&str>) -> Result<Arc<ConnectionPool>> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::ShuttingDown.into());
        }

        let mut table = self.hosts.lock();
        let host = match host.filter(|h| !h.is_empty()) {
            Some(host) if table.hosts.iter().any(|known| known == host) => host.to_string(),
            Some(_) => return Err(ConnectionError::NotFound.into()),
            None => table.next_host().ok_or(ConnectionError::NotFound)?,
        };

        let pool = table.pools.entry(host).or_insert_with_key(|host| {
            ConnectionPool::new(
                host.as_str(),
                self.config.pool_size(),
                self.config.connect_timeout(),
                Arc::clone(&self.pending),
                Arc::clone(&self.message_pool),
            )
        });

        Ok(Arc::clone(pool))
    }

    async fn apply_hosts(&self, hosts: Vec<String>) {
        let removed = self.hosts.lock().replace(hosts);

        for pool in removed {
            info!(service = %self.name, host = pool.addr(), "host removed, closing pool");
            pool.close().await;
        }
    }

    pub(crate) async fn refresh(&self) -> bool {
        let Some(resolver) = &self.resolver else {
            return false;
        };

        match resolver.resolve(&self.name).await {
            Ok(hosts) => {
                debug!(service = %self.name, ?hosts, "resolved hosts");
                self.apply_hosts(hosts).await;
                true
            }
            Err(e) => {
                warn!(service = %self.name, "host refresh failed, keeping previous hosts: {e}");
                false
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// RPC client for one named service.
///
/// Cheap to clone; clones share hosts, pools and the correlation table.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a new client builder.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(name)
    }

    /// Name of the service this client calls.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Known hosts in selection order.
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        self.inner.hosts.lock().hosts.clone()
    }

    /// Hosts that currently have a connection pool, sorted.
    #[must_use]
    pub fn active_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.inner.hosts.lock().pools.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Number of calls waiting for a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
    }

    /// Replace the host list, closing pools of hosts no longer present.
    pub async fn set_hosts<I, S>(&self, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .apply_hosts(hosts.into_iter().map(Into::into).collect())
            .await;
    }

    /// Re-resolve the host list now. Returns `false` without a discovery
    /// backend or when the query failed.
    pub async fn refresh_hosts(&self) -> bool {
        self.inner.refresh().await
    }

    /// Call `method` with a raw body.
    ///
    /// `host` pins the call to one known host; `None` picks the next host
    /// round-robin. The call waits for the client's request timeout or the
    /// context's deadline, whichever comes first.
    ///
    /// # Errors
    ///
    /// - [`ConnectionError::NotFound`] if `host` is not known or no hosts exist
    /// - [`Error::Timeout`] if the deadline passes, the context is cancelled or
    ///   the server answered with the timeout code
    /// - [`Error::Application`] if the handler returned a non-zero code
    /// - transport errors from dialing or writing
    #[instrument(skip(self, ctx, body), fields(service = %self.inner.name))]
    pub async fn call(
        &self,
        ctx: &CallContext,
        host: Option<&str>,
        codec: BodyCodec,
        method: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let deadline = {
            let default = Instant::now() + inner.config.request_timeout();
            ctx.deadline().map_or(default, |d| d.min(default))
        };

        let pool = inner.pick_pool(host)?;
        let conn = timeout_at(deadline, pool.get_conn())
            .await
            .map_err(|_| Error::Timeout)??;

        let mut request = inner.message_pool.acquire();
        request.message_type = MessageType::Data;
        request.content_type = inner.wire_format;
        request.compress_type = inner.compression;

        let envelope = &mut request.envelope;
        envelope.object_name.push_str(&inner.name);
        envelope.method.push_str(method);
        envelope.metadata.extend(
            ctx.metadata()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        envelope.metadata.insert(
            metadata_key::CONTENT_TYPE.to_string(),
            codec.name().to_string(),
        );
        if let Some(trace) = ctx.trace() {
            envelope
                .metadata
                .insert(metadata_key::TRACER.to_string(), trace.to_string());
        }
        envelope.body = body;

        let (pending, response) = inner.pending.register(conn.id());
        request.envelope.request_id = pending.id();

        // A read loop that already failed its waiters will not see this one
        if conn.is_closed() {
            return Err(ConnectionError::Closed.into());
        }

        match timeout_at(deadline, conn.send_message(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(host = pool.addr(), "send failed, evicting connection: {e}");
                pool.evict(&conn).await;
                return Err(e);
            }
            Err(_) => {
                pool.evict(&conn).await;
                return Err(Error::Timeout);
            }
        }
        drop(request);

        let mut response = tokio::select! {
            result = timeout_at(deadline, response) => match result {
                Ok(Ok(message)) => message,
                Ok(Err(_)) => return Err(ConnectionError::Closed.into()),
                Err(_) => {
                    debug!(request_id = pending.id(), "request timeout");
                    return Err(Error::Timeout);
                }
            },
            () = ctx.cancellation_token().cancelled() => return Err(Error::Timeout),
        };
        drop(pending);

        if response.envelope.code == code::TIMEOUT {
            return Err(Error::Timeout);
        }
        if response.envelope.code != 0 {
            return Err(Error::application(
                response.envelope.code,
                std::mem::take(&mut response.envelope.desc),
            ));
        }

        Ok(std::mem::take(&mut response.envelope.body))
    }

    /// Call `method` with a typed request, decoding a typed response.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call), plus codec failures.
    pub async fn request<Req, Resp>(
        &self,
        ctx: &CallContext,
        host: Option<&str>,
        codec: BodyCodec,
        method: &str,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Payload,
        Resp: Payload,
    {
        let body = codec.marshal(request)?;
        let out = self.call(ctx, host, codec, method, body).await?;
        codec.unmarshal(&out)
    }

    /// Call `method` on every host with an active pool, concurrently.
    ///
    /// A failure on one host does not affect the others.
    pub async fn broadcast_call(
        &self,
        ctx: &CallContext,
        codec: BodyCodec,
        method: &str,
        body: &[u8],
    ) -> HashMap<String, Result<Vec<u8>>> {
        let hosts = self.active_hosts();

        let results = join_all(
            hosts
                .iter()
                .map(|host| self.call(ctx, Some(host.as_str()), codec, method, body.to_vec())),
        )
        .await;

        hosts.into_iter().zip(results).collect()
    }

    /// Stop the resolver feed and close every pool. Calls still waiting
    /// fail with [`ConnectionError::Closed`].
    pub async fn close(&self) {
        self.inner.shutdown.cancel();

        let pools: Vec<Arc<ConnectionPool>> = self
            .inner
            .hosts
            .lock()
            .pools
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        for pool in pools {
            pool.close().await;
        }
        self.inner.pending.clear();

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!(service = %self.inner.name, "client closed");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.inner.name)
            .field("hosts", &self.hosts())
            .finish_non_exhaustive()
    }
}
