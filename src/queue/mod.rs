pub mod memory_queue;
pub mod redis_queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::error::QueueError;
use crate::engine::task::{TaskSpec, task};
use crate::engine::types::TaskOutput;

pub use memory_queue::MemoryQueue;
pub use redis_queue::RedisQueue;

pub const ENV_QUEUE_PROVIDER: &str = "QUEUE_PROVIDER";
pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_QUEUE_VISIBILITY_TIMEOUT_S: &str = "QUEUE_VISIBILITY_TIMEOUT_S";

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";

/// Unacked messages become visible again after this long.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// A message handed to a consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub message_id: String,
    pub payload: serde_json::Value,
    /// Delivery count, including this one.
    pub attempts: u32,
}

/// Minimal FIFO contract decoupling publishers from consumers.
///
/// A consumed message stays invisible until acked; if the consumer never
/// acks, the message redelivers after the visibility timeout (to the back of
/// the queue). Ordering is FIFO per queue; there is no cross-queue ordering.
#[async_trait]
pub trait WorkflowQueue: Send + Sync {
    /// Enqueue a payload, returning its message id.
    async fn publish(&self, payload: serde_json::Value) -> Result<String, QueueError>;

    /// Dequeue the next message, waiting up to `block_timeout` for one to
    /// arrive. Returns `None` on timeout.
    async fn consume(&self, block_timeout: Duration) -> Result<Option<QueueMessage>, QueueError>;

    /// Remove a consumed message for good. Returns false if the message was
    /// not in flight (already acked, or redelivered past its visibility
    /// window).
    async fn ack(&self, message_id: &str) -> Result<bool, QueueError>;
}

/// Build a queue from `QUEUE_PROVIDER` (`memory` by default, or `redis` with
/// `REDIS_URL`). `QUEUE_VISIBILITY_TIMEOUT_S` overrides the 30s default.
pub fn queue_from_env() -> Result<Arc<dyn WorkflowQueue>, QueueError> {
    let provider = std::env::var(ENV_QUEUE_PROVIDER)
        .unwrap_or_else(|_| "memory".to_string())
        .to_lowercase();

    let visibility = std::env::var(ENV_QUEUE_VISIBILITY_TIMEOUT_S)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT);

    match provider.as_str() {
        "memory" => {
            info!("Using in-memory queue (messages are lost on restart)");
            Ok(Arc::new(MemoryQueue::with_visibility_timeout(visibility)))
        }
        "redis" => {
            let url =
                std::env::var(ENV_REDIS_URL).unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
            info!(url = %url, "Using redis queue");
            Ok(Arc::new(RedisQueue::with_visibility_timeout(
                &url, visibility,
            )?))
        }
        other => Err(QueueError::UnknownProvider(other.to_string())),
    }
}

/// A task that publishes one context value to a queue.
///
/// The payload is `ctx[payload_key]` (an absent key publishes null). The
/// task's output records the message id under `<name>_message_id`.
pub fn publish_task(
    name: &str,
    queue: Arc<dyn WorkflowQueue>,
    payload_key: &str,
) -> TaskSpec {
    let payload_key = payload_key.to_string();
    let out_key = format!("{}_message_id", name);
    task(name, move |input| {
        let queue = queue.clone();
        let payload = input
            .ctx
            .get(&payload_key)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let out_key = out_key.clone();
        async move {
            let message_id = queue.publish(payload).await?;
            let mut out = TaskOutput::new();
            out.insert(out_key, serde_json::Value::String(message_id));
            Ok(out)
        }
    })
}

/// A task that consumes (and acks) one message from a queue.
///
/// The payload lands in the context under `output_key`; a consume timeout
/// yields null. The message id is recorded under `<name>_message_id`.
pub fn consume_task(
    name: &str,
    queue: Arc<dyn WorkflowQueue>,
    block_timeout: Duration,
    output_key: &str,
) -> TaskSpec {
    let output_key = output_key.to_string();
    let id_key = format!("{}_message_id", name);
    task(name, move |_input| {
        let queue = queue.clone();
        let output_key = output_key.clone();
        let id_key = id_key.clone();
        async move {
            let mut out = TaskOutput::new();
            match queue.consume(block_timeout).await? {
                Some(msg) => {
                    queue.ack(&msg.message_id).await?;
                    out.insert(output_key, msg.payload);
                    out.insert(id_key, serde_json::Value::String(msg.message_id));
                }
                None => {
                    out.insert(output_key, serde_json::Value::Null);
                }
            }
            Ok(out)
        }
    })
}
