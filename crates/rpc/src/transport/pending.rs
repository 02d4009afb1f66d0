//! Correlation of responses to waiting callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tracing::debug;

use crate::message_pool::PooledMessage;

struct Waiter {
    conn_id: u64,
    tx: oneshot::Sender<PooledMessage>,
}

/// Table of in-flight calls keyed by request id.
///
/// A request id is never handed out while an entry for it is still live, so
/// a response can only reach the caller that registered it. A waiter whose
/// sender is dropped without a response sees its connection as closed.
#[derive(Default)]
pub(crate) struct PendingRequests {
    waiters: DashMap<u32, Waiter>,
    next_id: AtomicU32,
}

impl PendingRequests {
    /// Allocate a request id and a slot for its response.
    pub(crate) fn register(
        self: &Arc<Self>,
        conn_id: u64,
    ) -> (PendingGuard, oneshot::Receiver<PooledMessage>) {
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter { conn_id, tx };

        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id == 0 {
                continue;
            }

            if let Entry::Vacant(slot) = self.waiters.entry(id) {
                slot.insert(waiter);
                let guard = PendingGuard {
                    id,
                    table: Arc::clone(self),
                };
                return (guard, rx);
            }
        }
    }

    /// Hand a response to its waiter. Responses nobody waits for are dropped.
    pub(crate) fn complete(&self, message: PooledMessage) {
        let id = message.envelope.request_id;

        match self.waiters.remove(&id) {
            Some((_, waiter)) => {
                if waiter.tx.send(message).is_err() {
                    debug!(request_id = id, "caller gone before response arrived");
                }
            }
            None => debug!(request_id = id, "dropping response with no waiter"),
        }
    }

    /// Fail every call waiting on connection `conn_id`.
    pub(crate) fn fail_connection(&self, conn_id: u64) {
        self.waiters.retain(|_, waiter| waiter.conn_id != conn_id);
    }

    /// Fail every waiting call.
    pub(crate) fn clear(&self) {
        self.waiters.clear();
    }

    /// Number of calls in flight.
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

/// Removes its entry from the table when dropped.
pub(crate) struct PendingGuard {
    id: u32,
    table: Arc<PendingRequests>,
}

impl PendingGuard {
    pub(crate) const fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.waiters.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_pool::MessagePool;
    use std::collections::HashSet;

    fn response(pool: &Arc<MessagePool>, request_id: u32) -> PooledMessage {
        let mut message = pool.acquire();
        message.envelope.request_id = request_id;
        message
    }

    #[tokio::test]
    async fn test_complete_reaches_matching_waiter() {
        let table = Arc::new(PendingRequests::default());
        let pool = MessagePool::new(4);

        let (first, first_rx) = table.register(1);
        let (second, second_rx) = table.register(1);
        assert_ne!(first.id(), second.id());

        table.complete(response(&pool, second.id()));
        table.complete(response(&pool, first.id()));

        assert_eq!(first_rx.await.unwrap().envelope.request_id, first.id());
        assert_eq!(second_rx.await.unwrap().envelope.request_id, second.id());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_guard_removes_entry() {
        let table = Arc::new(PendingRequests::default());
        let pool = MessagePool::new(4);

        let (guard, _rx) = table.register(1);
        let id = guard.id();
        assert_eq!(table.len(), 1);

        drop(guard);
        assert_eq!(table.len(), 0);

        // A late response is dropped, not delivered to anyone
        table.complete(response(&pool, id));
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_connection_only_hits_that_connection() {
        let table = Arc::new(PendingRequests::default());

        let (_a, a_rx) = table.register(1);
        let (_b, mut b_rx) = table.register(2);

        table.fail_connection(1);

        assert!(a_rx.await.is_err());
        assert!(b_rx.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_wraparound_skips_zero_and_live_ids() {
        let table = Arc::new(PendingRequests::default());
        table.next_id.store(u32::MAX - 2, Ordering::Relaxed);

        let (live, _live_rx) = table.register(1);
        assert_eq!(live.id(), u32::MAX - 1);

        let mut seen = HashSet::new();
        let mut guards = Vec::new();
        for _ in 0..3 {
            let (guard, rx) = table.register(1);
            assert_ne!(guard.id(), 0);
            assert!(seen.insert(guard.id()));
            guards.push((guard, rx));
        }

        // Force the counter back onto the live id; it must be skipped
        table.next_id.store(u32::MAX - 2, Ordering::Relaxed);
        let (next, _rx) = table.register(1);
        assert_ne!(next.id(), live.id());
        assert!(!seen.contains(&next.id()));
    }
}
