//! A framed TCP connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConnectionError, Result};
use crate::message_pool::{MessagePool, PooledMessage};
use crate::protocol::{Message, MessageCodec};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One socket with a message reader and a message writer.
///
/// Reads and writes are each serialized by their own lock, so one task may
/// read while others write. Frames are written whole and in lock order.
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    reader: Mutex<FramedRead<OwnedReadHalf, MessageCodec>>,
    writer: Mutex<FramedWrite<OwnedWriteHalf, MessageCodec>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Connection {
    /// Wrap an established stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer address cannot be read.
    pub fn new(stream: TcpStream, pool: Arc<MessagePool>) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            reader: Mutex::new(FramedRead::new(
                read_half,
                MessageCodec::new(Arc::clone(&pool)),
            )),
            writer: Mutex::new(FramedWrite::new(write_half, MessageCodec::new(pool))),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Dial `addr`, giving up after `connect_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ConnectFailed`] if the dial fails or times out.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        pool: Arc<MessagePool>,
    ) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::ConnectFailed {
                addr: addr.to_string(),
                source: std::io::ErrorKind::TimedOut.into(),
            })?
            .map_err(|source| ConnectionError::ConnectFailed {
                addr: addr.to_string(),
                source,
            })?;

        let conn = Self::new(stream, pool)?;
        debug!(id = conn.id, addr, "connected");

        Ok(conn)
    }

    /// Process-unique connection id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Remote address.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Read the next message.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Closed`] at end of stream or after
    /// [`close`](Self::close); decode and I/O failures otherwise.
    pub async fn read_message(&self) -> Result<PooledMessage> {
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }

        let mut reader = self.reader.lock().await;

        tokio::select! {
            () = self.shutdown.cancelled() => Err(ConnectionError::Closed.into()),
            frame = reader.next() => match frame {
                Some(result) => result,
                None => Err(ConnectionError::Closed.into()),
            },
        }
    }

    /// Write one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails. A
    /// failed write leaves the stream in an unknown state; the caller should
    /// stop using this connection.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed.into());
        }

        let mut writer = self.writer.lock().await;

        tokio::select! {
            () = self.shutdown.cancelled() => Err(ConnectionError::Closed.into()),
            result = writer.send(message) => result,
        }
    }

    /// Close the connection. Calling it again has no effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!(id = self.id, "shutdown failed: {e}");
        }
        debug!(id = self.id, peer = %self.peer_addr, "connection closed");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::{ContentType, Envelope, MessageType};
    use assert_matches::assert_matches;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let pool = MessagePool::new(8);

        let (dialed, accepted) = tokio::join!(
            Connection::connect(&addr, Duration::from_secs(1), Arc::clone(&pool)),
            listener.accept()
        );
        let (stream, _) = accepted.unwrap();

        (dialed.unwrap(), Connection::new(stream, pool).unwrap())
    }

    #[tokio::test]
    async fn test_send_and_read() {
        let (client, server) = pair().await;
        let message = Message {
            message_type: MessageType::Data,
            content_type: ContentType::Proto,
            envelope: Envelope {
                request_id: 5,
                method: "Echo".to_string(),
                body: b"hi".to_vec(),
                ..Envelope::default()
            },
            ..Message::default()
        };

        client.send_message(&message).await.unwrap();
        let received = server.read_message().await.unwrap();

        assert_eq!(received.envelope, message.envelope);
        assert!(received.body_len > 0);
        assert_ne!(client.id(), server.id());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_peer_sees_eof() {
        let (client, server) = pair().await;

        client.close().await;
        client.close().await;

        assert!(client.is_closed());
        assert_matches!(
            client.send_message(&Message::default()).await,
            Err(Error::Connection(ConnectionError::Closed))
        );
        assert_matches!(
            server.read_message().await,
            Err(Error::Connection(ConnectionError::Closed))
        );
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let (client, _server) = pair().await;
        let client = Arc::new(client);

        let reader = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.read_message().await })
        };
        tokio::task::yield_now().await;
        client.close().await;

        assert!(reader.await.unwrap().unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert_matches!(
            Connection::connect(&addr, Duration::from_secs(1), MessagePool::new(1)).await,
            Err(Error::Connection(ConnectionError::ConnectFailed { .. }))
        );
    }
}
