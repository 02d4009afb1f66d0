//! Per-host connection pool.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::connection::Connection;
use super::pending::PendingRequests;
use crate::error::{ConnectionError, Result};
use crate::message_pool::MessagePool;
use crate::protocol::MessageType;

/// Attempts made by [`ConnectionPool::get_conn`] before giving up.
const GET_CONN_ATTEMPTS: usize = 3;

#[derive(Default)]
struct PoolState {
    conns: Vec<Arc<Connection>>,
    cursor: usize,
}

/// Connections to one destination, grown lazily up to a fixed capacity.
///
/// Each connection gets a background read loop that feeds responses into
/// the owning client's correlation table and evicts the connection when
/// the stream ends.
pub struct ConnectionPool {
    addr: String,
    capacity: usize,
    connect_timeout: Duration,
    state: Mutex<PoolState>,
    pending: Arc<PendingRequests>,
    message_pool: Arc<MessagePool>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ConnectionPool {
    pub(crate) fn new(
        addr: impl Into<String>,
        capacity: usize,
        connect_timeout: Duration,
        pending: Arc<PendingRequests>,
        message_pool: Arc<MessagePool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            addr: addr.into(),
            capacity: capacity.max(1),
            connect_timeout,
            state: Mutex::new(PoolState::default()),
            pending,
            message_pool,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Destination address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Maximum number of connections.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of open connections.
    pub async fn len(&self) -> usize {
        self.state.lock().await.conns.len()
    }

    /// Whether the pool holds no connections.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get a usable connection, dialing while below capacity.
    ///
    /// # Errors
    ///
    /// Dial failures propagate immediately. Returns
    /// [`ConnectionError::NotFound`] when every attempt hit a dead connection.
    pub async fn get_conn(self: &Arc<Self>) -> Result<Arc<Connection>> {
        for attempt in 1..=GET_CONN_ATTEMPTS {
            match self.try_get_conn().await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_bad_connection() => {
                    debug!(addr = %self.addr, attempt, "skipping dead connection");
                }
                Err(e) => return Err(e),
            }
        }

        Err(ConnectionError::NotFound.into())
    }

    async fn try_get_conn(self: &Arc<Self>) -> Result<Arc<Connection>> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::ShuttingDown.into());
        }

        let mut state = self.state.lock().await;

        if state.conns.len() < self.capacity {
            let conn = Arc::new(
                Connection::connect(
                    &self.addr,
                    self.connect_timeout,
                    Arc::clone(&self.message_pool),
                )
                .await?,
            );
            state.conns.push(Arc::clone(&conn));
            self.spawn_read_loop(Arc::clone(&conn));
            return Ok(conn);
        }

        if state.cursor >= state.conns.len() {
            state.cursor = 0;
        }
        let conn = state
            .conns
            .get(state.cursor)
            .cloned()
            .ok_or(ConnectionError::BadConnection)?;
        state.cursor += 1;

        if conn.is_closed() {
            state.conns.retain(|c| c.id() != conn.id());
            return Err(ConnectionError::BadConnection.into());
        }

        Ok(conn)
    }

    fn spawn_read_loop(self: &Arc<Self>, conn: Arc<Connection>) {
        let pool = Arc::downgrade(self);
        let pending = Arc::clone(&self.pending);
        let shutdown = self.shutdown.clone();

        self.tasks.spawn(Self::read_loop(conn, pending, pool, shutdown));
    }

    async fn read_loop(
        conn: Arc<Connection>,
        pending: Arc<PendingRequests>,
        pool: Weak<Self>,
        shutdown: CancellationToken,
    ) {
        loop {
            let result = tokio::select! {
                () = shutdown.cancelled() => break,
                result = conn.read_message() => result,
            };

            match result {
                Ok(message) if message.message_type == MessageType::Ping => {}
                Ok(message) => pending.complete(message),
                Err(e) if e.is_closed() => {
                    debug!(id = conn.id(), "connection stream ended");
                    break;
                }
                Err(e) => {
                    warn!(id = conn.id(), peer = %conn.peer_addr(), "read failed: {e}");
                    break;
                }
            }
        }

        // Close before failing waiters so a caller registering late sees
        // the closed flag
        conn.close().await;
        pending.fail_connection(conn.id());

        if let Some(pool) = pool.upgrade() {
            pool.remove(conn.id()).await;
        }
    }

    /// Drop a connection from the pool and close it.
    pub async fn evict(&self, conn: &Connection) {
        self.remove(conn.id()).await;
        conn.close().await;
    }

    async fn remove(&self, conn_id: u64) {
        let mut state = self.state.lock().await;
        state.conns.retain(|c| c.id() != conn_id);
    }

    /// Close every connection and wait for their read loops to finish.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let conns = std::mem::take(&mut self.state.lock().await.conns);
        for conn in conns {
            conn.close().await;
            self.pending.fail_connection(conn.id());
        }

        self.tasks.close();
        self.tasks.wait().await;
        debug!(addr = %self.addr, "pool closed");
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.addr)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
