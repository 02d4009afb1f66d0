//! Reuse of decoded message objects.
//!
//! Every decoded frame borrows a [`Message`] from a [`MessagePool`] and the
//! [`PooledMessage`] guard hands it back, reset, when dropped. A message can
//! therefore never be observed after its release.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol::Message;

/// Default number of idle messages kept around.
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// Free list of reset [`Message`] objects.
#[derive(Debug)]
pub struct MessagePool {
    idle: Mutex<Vec<Message>>,
    max_idle: usize,
}

impl MessagePool {
    /// Create a pool that keeps at most `max_idle` released messages.
    #[must_use]
    pub fn new(max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        })
    }

    /// Take a reset message out of the pool, allocating when it is empty.
    #[must_use]
    pub fn acquire(self: &Arc<Self>) -> PooledMessage {
        let message = self.idle.lock().pop().unwrap_or_default();

        PooledMessage {
            message,
            pool: Arc::clone(self),
        }
    }

    /// Number of messages waiting for reuse.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, mut message: Message) {
        message.reset();

        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(message);
        }
    }
}

impl Default for MessagePool {
    fn default() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle: DEFAULT_MAX_IDLE,
        }
    }
}

/// A [`Message`] on loan from a [`MessagePool`].
#[derive(Debug)]
pub struct PooledMessage {
    message: Message,
    pool: Arc<MessagePool>,
}

impl Deref for PooledMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for PooledMessage {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

impl Drop for PooledMessage {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.message));
    }
}
