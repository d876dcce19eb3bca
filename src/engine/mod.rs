//! The DAG execution engine.
//!
//! Operations are grouped the way the run moves through the system:
//! - `definitions`: flow/step registration
//! - `lifecycle`: run creation, the run document read, retention pruning
//! - `scheduler`: readiness scan, taskless cascade, task dispatch
//! - `claim`: the worker-facing two-phase claim protocol
//! - `completion`: task completion/failure and run completion
//!
//! Every mutating operation is one transaction: it locks the run's slot for
//! its whole duration, so concurrent callers serialize per run and a
//! dependent step never observes a partially-updated parent.

mod claim;
mod completion;
mod definitions;
mod lifecycle;
mod scheduler;

pub use claim::ClaimedTask;
pub use definitions::StepOptions;
pub use lifecycle::RunWithStates;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::queue::WorkQueue;
use crate::store::EngineStore;

/// Handle to the orchestration engine. Cheap to clone; all state lives in
/// the shared store and the injected queue.
#[derive(Clone)]
pub struct Engine {
    store: Arc<EngineStore>,
    queue: Arc<dyn WorkQueue>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(queue: Arc<dyn WorkQueue>) -> Self {
        Self::with_config(queue, EngineConfig::default())
    }

    pub fn with_config(queue: Arc<dyn WorkQueue>, config: EngineConfig) -> Self {
        Self {
            store: Arc::new(EngineStore::new()),
            queue,
            config,
        }
    }

    pub(crate) fn store(&self) -> &EngineStore {
        &self.store
    }

    pub(crate) fn queue(&self) -> &dyn WorkQueue {
        self.queue.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
