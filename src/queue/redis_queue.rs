use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::engine::error::QueueError;
use crate::queue::{DEFAULT_VISIBILITY_TIMEOUT, QueueMessage, WorkflowQueue};

const DEFAULT_KEY_PREFIX: &str = "microflow:queue";

/// How often a blocked consumer polls for new or reclaimed messages.
const CONSUME_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Redis-backed FIFO queue.
///
/// Layout under the key prefix:
/// - `<prefix>:pending`: list of message ids in FIFO order
/// - `<prefix>:payloads`: hash of message id to serialized message
/// - `<prefix>:inflight`: sorted set of message id to visibility deadline
///
/// A consumed id moves from the list into the in-flight set; `ack` removes
/// it for good. Ids whose deadline passed are pushed back onto the list (at
/// the back) before each consume.
pub struct RedisQueue {
    client: redis::Client,
    key_prefix: String,
    visibility_timeout: Duration,
}

impl RedisQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        Self::with_visibility_timeout(redis_url, DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(
        redis_url: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            visibility_timeout,
        })
    }

    pub fn with_key_prefix(mut self, key_prefix: &str) -> Self {
        self.key_prefix = key_prefix.trim_end_matches(':').to_string();
        self
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.key_prefix)
    }

    fn payloads_key(&self) -> String {
        format!("{}:payloads", self.key_prefix)
    }

    fn inflight_key(&self) -> String {
        format!("{}:inflight", self.key_prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    /// Push ids whose visibility deadline passed back onto the pending list.
    async fn reclaim_expired(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(), QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let expired: Vec<String> = conn
            .zrangebyscore(self.inflight_key(), i64::MIN, now_ms)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        for id in expired {
            let removed: i64 = conn
                .zrem(self.inflight_key(), &id)
                .await
                .map_err(|e| QueueError::Connection(e.to_string()))?;
            // Someone else may have acked or reclaimed it in between.
            if removed > 0 {
                conn.rpush::<_, _, ()>(self.pending_key(), &id)
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn pop_one(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let id: Option<String> = conn
            .lpop(self.pending_key(), None)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let Some(id) = id else { return Ok(None) };

        let payload: Option<String> = conn
            .hget(self.payloads_key(), &id)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let Some(payload) = payload else {
            // Payload vanished (acked concurrently); nothing to deliver.
            return Ok(None);
        };

        let mut msg: QueueMessage = serde_json::from_str(&payload)?;
        msg.attempts += 1;

        conn.hset::<_, _, _, ()>(self.payloads_key(), &id, serde_json::to_string(&msg)?)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let deadline_ms =
            Utc::now().timestamp_millis() + self.visibility_timeout.as_millis() as i64;
        conn.zadd::<_, _, _, ()>(self.inflight_key(), &id, deadline_ms)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Some(msg))
    }
}

#[async_trait]
impl WorkflowQueue for RedisQueue {
    async fn publish(&self, payload: serde_json::Value) -> Result<String, QueueError> {
        let message_id = Uuid::new_v4().to_string();
        let msg = QueueMessage {
            message_id: message_id.clone(),
            payload,
            attempts: 0,
        };

        let mut conn = self.connection().await?;
        conn.hset::<_, _, _, ()>(self.payloads_key(), &message_id, serde_json::to_string(&msg)?)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        conn.rpush::<_, _, ()>(self.pending_key(), &message_id)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(message_id)
    }

    async fn consume(&self, block_timeout: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let deadline = tokio::time::Instant::now() + block_timeout;
        let mut conn = self.connection().await?;

        loop {
            self.reclaim_expired(&mut conn).await?;
            if let Some(msg) = self.pop_one(&mut conn).await? {
                return Ok(Some(msg));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(CONSUME_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, message_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .zrem(self.inflight_key(), message_id)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        conn.hdel::<_, _, ()>(self.payloads_key(), message_id)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(removed > 0)
    }
}
