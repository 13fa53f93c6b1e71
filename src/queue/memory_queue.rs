use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::engine::error::QueueError;
use crate::queue::{DEFAULT_VISIBILITY_TIMEOUT, QueueMessage, WorkflowQueue};

#[derive(Default)]
struct Inner {
    pending: VecDeque<QueueMessage>,
    inflight: HashMap<String, (QueueMessage, Instant)>,
}

impl Inner {
    /// Move messages whose visibility window elapsed back to the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .inflight
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((msg, _)) = self.inflight.remove(&id) {
                self.pending.push_back(msg);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.inflight.values().map(|(_, deadline)| *deadline).min()
    }
}

/// Process-local FIFO queue. Messages live in memory only and are lost when
/// the process exits; durability needs the redis variant.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Messages waiting to be consumed.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    /// Messages consumed but not yet acked.
    pub fn inflight_len(&self) -> usize {
        self.inner.lock().unwrap().inflight.len()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowQueue for MemoryQueue {
    async fn publish(&self, payload: serde_json::Value) -> Result<String, QueueError> {
        let message_id = Uuid::new_v4().to_string();
        let msg = QueueMessage {
            message_id: message_id.clone(),
            payload,
            attempts: 0,
        };
        self.inner.lock().unwrap().pending.push_back(msg);
        self.notify.notify_one();
        Ok(message_id)
    }

    async fn consume(&self, block_timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let deadline = Instant::now() + block_timeout;

        loop {
            let next_expiry = {
                let mut inner = self.inner.lock().unwrap();
                let now = Instant::now();
                inner.reclaim_expired(now);

                if let Some(mut msg) = inner.pending.pop_front() {
                    msg.attempts += 1;
                    inner
                        .inflight
                        .insert(msg.message_id.clone(), (msg.clone(), now + self.visibility_timeout));
                    return Ok(Some(msg));
                }
                inner.next_expiry()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // Wake on publish, or when the earliest in-flight message may
            // redeliver, or at the caller's deadline.
            let mut wait = deadline - now;
            if let Some(expiry) = next_expiry {
                wait = wait.min(expiry.saturating_duration_since(now).max(Duration::from_millis(1)));
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, message_id: &str) -> Result<bool, QueueError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .inflight
            .remove(message_id)
            .is_some())
    }
}
