//! Worker registry.
//!
//! External worker processes advertise themselves here so operators can see
//! who is draining a queue and reap rows for workers that stopped
//! heartbeating.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::Engine;

/// One registered worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRow {
    pub worker_id: Uuid,
    /// Queue (flow) the worker drains.
    pub queue_name: String,
    /// Handler entrypoint the worker reports, informational only.
    pub function_name: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Engine {
    /// Register a worker or refresh its registration.
    pub fn register_worker(
        &self,
        worker_id: Uuid,
        queue_name: &str,
        function_name: &str,
    ) -> WorkerRow {
        let now = Utc::now();
        self.store().upsert_worker(WorkerRow {
            worker_id,
            queue_name: queue_name.to_string(),
            function_name: function_name.to_string(),
            started_at: now,
            last_heartbeat_at: now,
        })
    }

    /// Refresh a worker's heartbeat; returns the updated row, or `None` for
    /// a worker that was never registered.
    pub fn worker_heartbeat(&self, worker_id: Uuid) -> Option<WorkerRow> {
        let mut row = self.store().worker(worker_id)?;
        row.last_heartbeat_at = Utc::now();
        Some(self.store().upsert_worker(row))
    }

    /// Drop workers whose last heartbeat is older than `older_than`.
    pub fn prune_inactive_workers(&self, older_than: Duration) -> usize {
        let pruned = self.store().prune_workers(Utc::now() - older_than);
        if pruned > 0 {
            tracing::info!(pruned, "pruned inactive workers");
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::queue::MemoryQueue;
    use std::sync::Arc;

    fn engine() -> Engine {
        Engine::with_config(Arc::new(MemoryQueue::new()), EngineConfig::test_config())
    }

    #[test]
    fn register_and_heartbeat_preserve_started_at() {
        let engine = engine();
        let worker_id = Uuid::new_v4();
        let registered = engine.register_worker(worker_id, "analytics", "handler");

        let beat = engine.worker_heartbeat(worker_id).expect("registered");
        assert_eq!(beat.started_at, registered.started_at);
        assert!(beat.last_heartbeat_at >= registered.last_heartbeat_at);
    }

    #[test]
    fn heartbeat_for_unknown_worker_returns_none() {
        let engine = engine();
        assert!(engine.worker_heartbeat(Uuid::new_v4()).is_none());
    }

    #[test]
    fn prune_reaps_only_stale_workers() {
        let engine = engine();
        let worker_id = Uuid::new_v4();
        engine.register_worker(worker_id, "analytics", "handler");

        assert_eq!(engine.prune_inactive_workers(Duration::hours(1)), 0);
        assert_eq!(engine.prune_inactive_workers(Duration::seconds(-1)), 1);
        assert!(engine.worker_heartbeat(worker_id).is_none());
    }
}
