//! Cairn - DAG workflow orchestration with an at-least-once task queue.
//!
//! Workflows are defined as DAGs of steps, executed by resolving
//! dependencies, fanning map steps out over arrays, and dispatching tasks
//! through an injected message queue to external workers. The engine tracks
//! per-task retry state with exponential backoff and aggregates leaf-step
//! outputs into the run result.

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod observability;
pub mod queue;
pub mod retry;
pub mod store;
pub mod workers;

pub use config::{EffectiveConfig, EngineConfig};
pub use engine::{ClaimedTask, Engine, RunWithStates, StepOptions};
pub use error::{EngineError, EngineResult};
pub use model::{
    Dependency, Flow, Run, RunStatus, Step, StepState, StepStatus, StepTask, StepType,
    TaskMessage, TaskStatus,
};
pub use queue::{MemoryQueue, QueueError, QueueMessage, QueueResult, WorkQueue};
pub use retry::retry_delay;
pub use workers::WorkerRow;
