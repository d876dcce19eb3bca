//! Message queue contract consumed by the engine.
//!
//! The engine never owns queue state; it talks to an injected [`WorkQueue`]
//! capability with at-least-once delivery and per-message visibility
//! timeouts. [`MemoryQueue`] implements the contract for tests and local
//! runs; a production deployment plugs in a broker-backed implementation
//! behind the same trait.

mod memory;

pub use memory::MemoryQueue;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("message {msg_id} not found in queue {queue:?}")]
    MessageNotFound { queue: String, msg_id: i64 },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A message as returned by [`WorkQueue::read`].
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub msg_id: i64,
    /// Number of times the message has been read (delivery attempts).
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    /// Instant until which the message is hidden from readers.
    pub vt: DateTime<Utc>,
    pub payload: Value,
}

/// At-least-once message queue with visibility timeouts.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue one payload; `delay_seconds` hides it until that many seconds
    /// from now. Returns the assigned message id.
    async fn send(&self, queue: &str, payload: &Value, delay_seconds: i64) -> QueueResult<i64>;

    /// Enqueue a batch; returns message ids in payload order.
    async fn send_batch(
        &self,
        queue: &str,
        payloads: &[Value],
        delay_seconds: i64,
    ) -> QueueResult<Vec<i64>>;

    /// Read up to `qty` visible messages, hiding each for `vt_seconds`.
    async fn read(&self, queue: &str, vt_seconds: i64, qty: usize) -> QueueResult<Vec<QueueMessage>>;

    /// Re-hide one message until `vt_seconds` from now.
    async fn set_vt(&self, queue: &str, msg_id: i64, vt_seconds: i64) -> QueueResult<()>;

    /// Batched [`WorkQueue::set_vt`]: `(msg_id, vt_seconds)` pairs.
    async fn set_vt_batch(&self, queue: &str, entries: &[(i64, i64)]) -> QueueResult<()>;

    /// Remove messages from the active queue, retaining them in an archive.
    /// Unknown ids are ignored so archival stays idempotent.
    async fn archive(&self, queue: &str, msg_ids: &[i64]) -> QueueResult<()>;
}

/// Poll `queue` until at least one message is visible or the time budget
/// lapses. Returns whatever the final read produced (possibly empty).
pub async fn read_with_poll(
    queue: &dyn WorkQueue,
    queue_name: &str,
    vt_seconds: i64,
    qty: usize,
    max_poll_seconds: u64,
    poll_interval_ms: u64,
) -> QueueResult<Vec<QueueMessage>> {
    let deadline = Instant::now() + Duration::from_secs(max_poll_seconds);
    loop {
        let messages = queue.read(queue_name, vt_seconds, qty).await?;
        if !messages.is_empty() || Instant::now() >= deadline {
            return Ok(messages);
        }
        tokio::time::sleep(Duration::from_millis(poll_interval_ms.max(1))).await;
    }
}
