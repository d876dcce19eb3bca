//! Engine error types.

use thiserror::Error;
use uuid::Uuid;

use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid slug {slug:?}: {reason}")]
    InvalidSlug { slug: String, reason: &'static str },

    #[error("map step {step_slug:?} cannot have more than one dependency")]
    InvalidMapArity { step_slug: String },

    #[error("step {step_slug:?} depends on unknown step {dep_slug:?}")]
    UnknownDependency {
        step_slug: String,
        dep_slug: String,
    },

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("step not found: {flow_slug}/{step_slug}")]
    StepNotFound {
        flow_slug: String,
        step_slug: String,
    },

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("task not found: {run_id}/{step_slug}[{task_index}]")]
    TaskNotFound {
        run_id: Uuid,
        step_slug: String,
        task_index: i32,
    },

    #[error("run already exists: {0}")]
    RunAlreadyExists(Uuid),

    #[error("flow {flow_slug:?} has root map steps; run input must be a JSON array")]
    RootMapInputNotArray { flow_slug: String },

    #[error(
        "taskless cascade exceeded {limit} iterations for run {run_id}; dependency graph is malformed"
    )]
    CascadeLimitExceeded { run_id: Uuid, limit: u32 },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type EngineResult<T> = Result<T, EngineError>;
