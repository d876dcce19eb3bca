//! In-memory queue implementation for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;

use super::{QueueMessage, QueueResult, WorkQueue};

#[derive(Default)]
struct Inner {
    next_msg_id: i64,
    queues: HashMap<String, QueueState>,
}

#[derive(Default)]
struct QueueState {
    messages: Vec<QueueMessage>,
    archived: Vec<QueueMessage>,
}

/// Queue that stores messages in memory with real visibility-timeout
/// semantics: `read` hides messages and bumps `read_ct`, expired visibility
/// makes a message deliverable again, `archive` moves it to an inspectable
/// archive table.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages still sitting in the active queue (visible or hidden).
    pub fn pending(&self, queue: &str) -> usize {
        let inner = self.inner.lock().expect("queue state poisoned");
        inner.queues.get(queue).map_or(0, |q| q.messages.len())
    }

    /// Messages currently deliverable by a `read`.
    pub fn visible(&self, queue: &str) -> usize {
        let now = Utc::now();
        let inner = self.inner.lock().expect("queue state poisoned");
        inner.queues.get(queue).map_or(0, |q| {
            q.messages.iter().filter(|m| m.vt <= now).count()
        })
    }

    /// Archived messages, in archival order.
    pub fn archived(&self, queue: &str) -> Vec<QueueMessage> {
        let inner = self.inner.lock().expect("queue state poisoned");
        inner
            .queues
            .get(queue)
            .map(|q| q.archived.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, queue: &str, payload: &Value, delay_seconds: i64) -> QueueResult<i64> {
        let ids = self.send_batch(queue, std::slice::from_ref(payload), delay_seconds).await?;
        Ok(ids[0])
    }

    async fn send_batch(
        &self,
        queue: &str,
        payloads: &[Value],
        delay_seconds: i64,
    ) -> QueueResult<Vec<i64>> {
        let now = Utc::now();
        let visible_at = now + Duration::seconds(delay_seconds.max(0));
        let mut inner = self.inner.lock().expect("queue state poisoned");
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            inner.next_msg_id += 1;
            let msg_id = inner.next_msg_id;
            let state = inner.queues.entry(queue.to_string()).or_default();
            state.messages.push(QueueMessage {
                msg_id,
                read_ct: 0,
                enqueued_at: now,
                vt: visible_at,
                payload: payload.clone(),
            });
            ids.push(msg_id);
        }
        Ok(ids)
    }

    async fn read(&self, queue: &str, vt_seconds: i64, qty: usize) -> QueueResult<Vec<QueueMessage>> {
        let now = Utc::now();
        let hidden_until = now + Duration::seconds(vt_seconds.max(0));
        let mut inner = self.inner.lock().expect("queue state poisoned");
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let mut delivered = Vec::new();
        for message in state.messages.iter_mut() {
            if delivered.len() >= qty {
                break;
            }
            if message.vt <= now {
                message.vt = hidden_until;
                message.read_ct += 1;
                delivered.push(message.clone());
            }
        }
        Ok(delivered)
    }

    async fn set_vt(&self, queue: &str, msg_id: i64, vt_seconds: i64) -> QueueResult<()> {
        self.set_vt_batch(queue, &[(msg_id, vt_seconds)]).await
    }

    async fn set_vt_batch(&self, queue: &str, entries: &[(i64, i64)]) -> QueueResult<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("queue state poisoned");
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(());
        };
        for (msg_id, vt_seconds) in entries {
            if let Some(message) = state.messages.iter_mut().find(|m| m.msg_id == *msg_id) {
                message.vt = now + Duration::seconds((*vt_seconds).max(0));
            }
        }
        Ok(())
    }

    async fn archive(&self, queue: &str, msg_ids: &[i64]) -> QueueResult<()> {
        let mut inner = self.inner.lock().expect("queue state poisoned");
        let Some(state) = inner.queues.get_mut(queue) else {
            return Ok(());
        };
        let mut remaining = Vec::with_capacity(state.messages.len());
        for message in state.messages.drain(..) {
            if msg_ids.contains(&message.msg_id) {
                state.archived.push(message);
            } else {
                remaining.push(message);
            }
        }
        state.messages = remaining;
        Ok(())
    }
}
