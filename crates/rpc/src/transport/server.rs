//! RPC server implementation.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::connection::Connection;
use crate::config::ServerConfig;
use crate::context::{CallContext, metadata_key};
use crate::error::{Error, Result, code};
use crate::message_pool::{MessagePool, PooledMessage};
use crate::protocol::{BodyCodec, Message, MessageType};
use crate::service::Service;
use crate::trace::Trace;

/// Lifecycle of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, not yet bound.
    Created,
    /// Accepting connections on the given address.
    Listening(SocketAddr),
    /// Stopped; cannot be restarted.
    Stopped,
}

/// TCP server dispatching calls to one [`Service`].
///
/// Every data frame is handled in its own task. Concurrent handler runs are
/// bounded by an admission gate of `max_invoke` slots; a request waits for a
/// slot until its invocation deadline and is answered with a timeout if none
/// frees up. Exactly one response is written per request.
pub struct Server {
    config: ServerConfig,
    service: Arc<dyn Service>,
    message_pool: Arc<MessagePool>,
    admission: Arc<Semaphore>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    state: watch::Sender<ServerState>,
    started: AtomicBool,
    accepting: CancellationToken,
    shutdown: CancellationToken,
    connection_tasks: TaskTracker,
    invocations: TaskTracker,
}

impl Server {
    /// Create a new server for `service`.
    #[must_use]
    pub fn new<S: Service>(config: ServerConfig, service: S) -> Arc<Self> {
        Self::with_service(config, Arc::new(service))
    }

    /// Create a new server for an already shared service.
    #[must_use]
    pub fn with_service(config: ServerConfig, service: Arc<dyn Service>) -> Arc<Self> {
        Arc::new(Self {
            admission: Arc::new(Semaphore::new(config.max_invoke())),
            config,
            service,
            message_pool: Arc::new(MessagePool::default()),
            connections: Mutex::new(HashMap::new()),
            state: watch::Sender::new(ServerState::Created),
            started: AtomicBool::new(false),
            accepting: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            connection_tasks: TaskTracker::new(),
            invocations: TaskTracker::new(),
        })
    }

    /// Service object name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Server configuration.
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Bound address once listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self.state() {
            ServerState::Listening(addr) => Some(addr),
            _ => None,
        }
    }

    /// Wait until the server is listening.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ShuttingDown`](crate::ConnectionError::ShuttingDown)
    /// if the server stopped, or failed to bind, before it listened.
    pub async fn ready(&self) -> Result<SocketAddr> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| *state != ServerState::Created)
            .await
            .map(|state| *state)
            .unwrap_or(ServerState::Stopped);

        match state {
            ServerState::Listening(addr) => Ok(addr),
            _ => Err(crate::error::ConnectionError::ShuttingDown.into()),
        }
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Number of handlers currently holding an admission slot.
    #[must_use]
    pub fn active_invocations(&self) -> usize {
        self.config.max_invoke() - self.admission.available_permits()
    }

    /// Bind, signal readiness and accept connections until stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails, if the server was already started,
    /// or if accepting fails for a reason other than shutdown.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted(self.config.name.clone()));
        }

        let listen_addr = self.config.listen_addr();
        let listener = match TcpListener::bind(&listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state.send_replace(ServerState::Stopped);
                return Err(io::Error::new(
                    e.kind(),
                    format!("Failed to bind to {listen_addr}: {e}"),
                )
                .into());
            }
        };
        let local_addr = listener.local_addr()?;

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

        info!(server = %self.config.name, addr = %local_addr, "RPC server listening");

        loop {
            let accepted = tokio::select! {
                () = self.accepting.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(server = %self.config.name, %peer, "accepted connection");
                    self.handle_accept(stream);
                }
                Err(e) => {
                    error!(server = %self.config.name, "accept failed: {e}");
                    self.stop().await;
                    return Err(e.into());
                }
            }
        }

        debug!(server = %self.config.name, "accept loop finished");
        Ok(())
    }

    fn handle_accept(self: &Arc<Self>, stream: TcpStream) {
        let conn = match Connection::new(stream, Arc::clone(&self.message_pool)) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                warn!(server = %self.config.name, "dropping accepted socket: {e}");
                return;
            }
        };

        self.connections.lock().insert(conn.id(), Arc::clone(&conn));

        let server = Arc::clone(self);
        self.connection_tasks
            .spawn(async move { server.serve_connection(conn).await });
    }

    async fn serve_connection(self: Arc<Self>, conn: Arc<Connection>) {
        loop {
            let result = tokio::select! {
                () = self.shutdown.cancelled() => break,
                result = conn.read_message() => result,
            };

            match result {
                Ok(message) => match message.message_type {
                    MessageType::Ping => {}
                    MessageType::Data => {
                        let server = Arc::clone(&self);
                        let conn = Arc::clone(&conn);
                        self.invocations
                            .spawn(async move { server.invoke(conn, message).await });
                    }
                },
                Err(e) if e.is_closed() => {
                    debug!(server = %self.config.name, id = conn.id(), "connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(server = %self.config.name, id = conn.id(), peer = %conn.peer_addr(), "read failed: {e}");
                    break;
                }
            }
        }

        self.connections.lock().remove(&conn.id());
        conn.close().await;
    }

    async fn invoke(self: Arc<Self>, conn: Arc<Connection>, mut request: PooledMessage) {
        let deadline = self.config.invoke_timeout().map(|t| Instant::now() + t);

        let mut response = self.message_pool.acquire();
        response.message_type = MessageType::Data;
        response.content_type = request.content_type;
        response.compress_type = request.compress_type;
        response.envelope.request_id = request.envelope.request_id;

        let Some(permit) = self.admit(deadline).await else {
            debug!(
                server = %self.config.name,
                request_id = request.envelope.request_id,
                "no admission slot before deadline"
            );
            set_error(&mut response, &Error::Timeout);
            self.respond(&conn, &response).await;
            return;
        };

        let request_id = request.envelope.request_id;
        let method = std::mem::take(&mut request.envelope.method);
        let body = std::mem::take(&mut request.envelope.body);
        let mut metadata = std::mem::take(&mut request.envelope.metadata);
        drop(request);

        metadata.insert(
            metadata_key::CLIENT_IP.to_string(),
            conn.peer_addr().ip().to_string(),
        );
        let trace = Trace::continue_from(
            metadata.get(metadata_key::TRACER).map(String::as_str),
            &method,
        );
        metadata.insert(
            metadata_key::TRACE_ID.to_string(),
            trace.trace_id().to_string(),
        );
        metadata.insert(metadata_key::SPAN_ID.to_string(), trace.span_id());
        let codec = BodyCodec::for_content_type(
            metadata
                .get(metadata_key::CONTENT_TYPE)
                .map_or("", String::as_str),
        );

        let span = info_span!(
            "invoke",
            server = %self.config.name,
            %method,
            request_id,
            trace_id = %trace.trace_id(),
            span_id = %trace.span_id(),
        );
        let ctx = CallContext::for_invocation(metadata, trace, deadline);
        let cancel = ctx.cancellation_token().clone();

        let service = Arc::clone(&self.service);
        let mut handle = tokio::spawn(
            async move {
                let _permit: OwnedSemaphorePermit = permit;
                service.call(ctx, codec, &method, body).await
            }
            .instrument(span.clone()),
        );

        let result = tokio::select! {
            joined = &mut handle => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    let reason = panic_message(e.into_panic().as_ref());
                    span.in_scope(|| error!("handler panicked: {reason}"));
                    Err(Error::application(code::INTERNAL, format!("handler panicked: {reason}")))
                }
                Err(e) => Err(Error::application(code::INTERNAL, e.to_string())),
            },
            () = sleep_until_deadline(deadline) => {
                cancel.cancel();
                handle.abort();
                span.in_scope(|| warn!("invocation timed out, handler cancelled"));
                Err(Error::Timeout)
            },
            () = self.shutdown.cancelled() => {
                cancel.cancel();
                handle.abort();
                return;
            },
        };

        match result {
            Ok(body) => response.envelope.body = body,
            Err(e) => set_error(&mut response, &e),
        }
        self.respond(&conn, &response).await;
    }

    async fn admit(&self, deadline: Option<Instant>) -> Option<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.admission).acquire_owned();

        match deadline {
            Some(deadline) => timeout_at(deadline, acquire).await.ok()?.ok(),
            None => acquire.await.ok(),
        }
    }

    async fn respond(&self, conn: &Connection, response: &Message) {
        if let Err(e) = conn.send_message(response).await {
            debug!(
                server = %self.config.name,
                request_id = response.envelope.request_id,
                "failed to send response: {e}"
            );
        }
    }

    /// Stop accepting, close every connection and wait for their read loops.
    /// Handlers still running are cancelled. Calling it again has no effect.
    pub async fn stop(&self) {
        let stopped = self.state.send_if_modified(|state| {
            if *state == ServerState::Stopped {
                false
            } else {
                *state = ServerState::Stopped;
                true
            }
        });
        if !stopped {
            return;
        }

        self.accepting.cancel();
        self.shutdown.cancel();
        self.admission.close();

        let conns: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in conns {
            conn.close().await;
        }

        self.connection_tasks.close();
        self.connection_tasks.wait().await;
        self.invocations.close();
        self.invocations.wait().await;

        info!(server = %self.config.name, "RPC server stopped");
    }

    /// Stop accepting and give in-flight invocations up to `grace` to
    /// finish, then [`stop`](Self::stop).
    pub async fn drain(&self, grace: Duration) {
        self.accepting.cancel();
        self.invocations.close();

        if timeout(grace, self.invocations.wait()).await.is_err() {
            warn!(
                server = %self.config.name,
                remaining = self.invocations.len(),
                "drain grace period elapsed"
            );
        }

        self.stop().await;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn set_error(response: &mut Message, error: &Error) {
    response.envelope.body.clear();
    response.envelope.code = error.code();
    response.envelope.desc = error.desc();
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tracing_test::traced_test;

    struct Nop;

    #[async_trait::async_trait]
    impl Service for Nop {
        async fn call(
            &self,
            _ctx: CallContext,
            _codec: BodyCodec,
            _method: &str,
            body: Vec<u8>,
        ) -> Result<Vec<u8>> {
            Ok(body)
        }
    }

    fn server() -> Arc<Server> {
        Server::new(ServerConfig::new("nop", "127.0.0.1", 0), Nop)
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let server = server();
        assert_eq!(server.state(), ServerState::Created);

        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.start().await })
        };
        let addr = server.ready().await.unwrap();
        assert_eq!(server.state(), ServerState::Listening(addr));
        assert_ne!(addr.port(), 0);

        server.stop().await;
        server.stop().await;
        assert_eq!(server.state(), ServerState::Stopped);
        running.await.unwrap().unwrap();

        assert_matches!(server.start().await, Err(Error::AlreadyStarted(_)));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let server = server();
        server.stop().await;

        assert!(server.ready().await.is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = Server::new(ServerConfig::new("nop", "127.0.0.1", port), Nop);

        assert_matches!(server.start().await, Err(Error::Io(_)));
        assert!(server.ready().await.is_err());
    }

    struct Panics;

    #[async_trait::async_trait]
    impl Service for Panics {
        async fn call(
            &self,
            _ctx: CallContext,
            _codec: BodyCodec,
            method: &str,
            body: Vec<u8>,
        ) -> Result<Vec<u8>> {
            assert!(method != "Explode", "boom");
            Ok(body)
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_panic_is_logged_and_answered() {
        let server = Server::new(ServerConfig::new("panics", "127.0.0.1", 0), Panics);
        {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.start().await });
        }
        let addr = server.ready().await.unwrap();

        let conn = Connection::connect(
            &addr.to_string(),
            Duration::from_secs(1),
            MessagePool::new(4),
        )
        .await
        .unwrap();

        for (request_id, method) in [(1, "Explode"), (2, "Echo")] {
            let mut request = Message::default();
            request.envelope.request_id = request_id;
            request.envelope.method = method.to_string();
            request.envelope.body = b"x".to_vec();
            conn.send_message(&request).await.unwrap();

            let response = conn.read_message().await.unwrap();
            assert_eq!(response.envelope.request_id, request_id);
            if method == "Explode" {
                assert_eq!(response.envelope.code, code::INTERNAL);
                assert!(response.envelope.desc.contains("boom"));
            } else {
                assert_eq!(response.envelope.code, 0);
                assert_eq!(response.envelope.body, b"x");
            }
        }

        assert!(logs_contain("handler panicked"));
        server.stop().await;
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"boom".to_string()), "boom");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }
}
