//! In-memory transactional substrate for definitions and run state.
//!
//! Flow definitions are copy-on-write `Arc` snapshots behind an `RwLock`
//! that is never held across an await. Each run lives in its own
//! `tokio::sync::Mutex<RunSlot>`; holding that lock for the duration of an
//! operation is the equivalent of one atomic transaction with an exclusive
//! run-row lock. Step states sit in a `BTreeMap` keyed by `step_slug`, so
//! every caller observes and mutates them in the same alphabetical order.
//!
//! Lock order across the engine: run slot, then message index, then queue
//! state. Operations touching several runs lock them in ascending run-id
//! order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{Dependency, Flow, Run, Step, StepState, StepTask, StepType, TaskStatus};
use crate::workers::WorkerRow;

// ============================================================================
// Flow definitions
// ============================================================================

/// A flow plus its steps and dependency edges, with adjacency indexes both
/// ways.
#[derive(Debug, Clone)]
pub struct FlowDefinition {
    pub flow: Flow,
    /// Steps in insertion (`step_index`) order.
    pub steps: Vec<Step>,
    pub dependencies: Vec<Dependency>,
    deps_by_step: HashMap<String, Vec<String>>,
    dependents_by_step: HashMap<String, Vec<String>>,
}

impl FlowDefinition {
    pub fn new(flow: Flow) -> Self {
        Self {
            flow,
            steps: Vec::new(),
            dependencies: Vec::new(),
            deps_by_step: HashMap::new(),
            dependents_by_step: HashMap::new(),
        }
    }

    pub fn step(&self, step_slug: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_slug == step_slug)
    }

    /// Direct dependencies of `step_slug`, in declaration order.
    pub fn deps(&self, step_slug: &str) -> &[String] {
        self.deps_by_step
            .get(step_slug)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Steps that directly depend on `step_slug`.
    pub fn dependents(&self, step_slug: &str) -> &[String] {
        self.dependents_by_step
            .get(step_slug)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_root_map_steps(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.step_type == StepType::Map && s.deps_count == 0)
    }

    /// Steps that are nobody's dependency; their outputs form the run output.
    pub fn leaf_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(|s| self.dependents(&s.step_slug).is_empty())
    }

    /// Record a new step and its edges. The caller has already validated
    /// slugs, arity and that every dependency exists.
    pub(crate) fn push_step(&mut self, step: Step, dep_slugs: &[String]) {
        for dep_slug in dep_slugs {
            self.dependencies.push(Dependency {
                flow_slug: self.flow.flow_slug.clone(),
                dep_slug: dep_slug.clone(),
                step_slug: step.step_slug.clone(),
            });
            self.deps_by_step
                .entry(step.step_slug.clone())
                .or_default()
                .push(dep_slug.clone());
            self.dependents_by_step
                .entry(dep_slug.clone())
                .or_default()
                .push(step.step_slug.clone());
        }
        self.steps.push(step);
    }
}

// ============================================================================
// Run slots
// ============================================================================

/// All mutable state of one run: the run row, its step states and its tasks.
/// Guarded as a unit by the slot mutex.
#[derive(Debug)]
pub struct RunSlot {
    pub run: Run,
    pub step_states: BTreeMap<String, StepState>,
    pub step_tasks: BTreeMap<(String, i32), StepTask>,
}

impl RunSlot {
    pub fn state(&self, step_slug: &str) -> Option<&StepState> {
        self.step_states.get(step_slug)
    }

    pub fn state_mut(&mut self, step_slug: &str) -> Option<&mut StepState> {
        self.step_states.get_mut(step_slug)
    }

    pub fn task(&self, step_slug: &str, task_index: i32) -> Option<&StepTask> {
        self.step_tasks
            .get(&(step_slug.to_string(), task_index))
    }

    pub fn task_mut(&mut self, step_slug: &str, task_index: i32) -> Option<&mut StepTask> {
        self.step_tasks
            .get_mut(&(step_slug.to_string(), task_index))
    }

    /// Tasks of one step in `task_index` order.
    pub fn tasks_of_step(&self, step_slug: &str) -> impl Iterator<Item = &StepTask> {
        self.step_tasks
            .range((step_slug.to_string(), i32::MIN)..=(step_slug.to_string(), i32::MAX))
            .map(|(_, task)| task)
    }

    pub fn completed_task_count(&self, step_slug: &str) -> i32 {
        self.tasks_of_step(step_slug)
            .filter(|t| t.status == TaskStatus::Completed)
            .count() as i32
    }

    /// A step's output as seen by its dependents: a single step contributes
    /// its lone task output, a map step the `task_index`-ordered array of
    /// task outputs.
    pub fn aggregated_step_output(&self, step: &Step) -> Value {
        match step.step_type {
            StepType::Single => self
                .task(&step.step_slug, 0)
                .and_then(|t| t.output.clone())
                .unwrap_or(Value::Null),
            StepType::Map => Value::Array(
                self.tasks_of_step(&step.step_slug)
                    .map(|t| t.output.clone().unwrap_or(Value::Null))
                    .collect(),
            ),
        }
    }

    /// Message ids of every non-terminal task; what must be archived when
    /// the run dies.
    pub fn in_flight_message_ids(&self) -> Vec<i64> {
        self.step_tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .filter_map(|t| t.message_id)
            .collect()
    }
}

/// Resolves a queue message back to the task it dispatched.
#[derive(Debug, Clone)]
pub struct MessageRef {
    pub run_id: Uuid,
    pub step_slug: String,
    pub task_index: i32,
}

// ============================================================================
// Store
// ============================================================================

/// Process-local store holding definitions, run slots, the message index and
/// the worker registry.
#[derive(Default)]
pub struct EngineStore {
    flows: RwLock<HashMap<String, Arc<FlowDefinition>>>,
    runs: RwLock<HashMap<Uuid, Arc<AsyncMutex<RunSlot>>>>,
    messages: StdMutex<HashMap<(String, i64), MessageRef>>,
    workers: StdMutex<HashMap<Uuid, WorkerRow>>,
}

impl EngineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flow(&self, flow_slug: &str) -> Option<Arc<FlowDefinition>> {
        let flows = self.flows.read().expect("flow table poisoned");
        flows.get(flow_slug).cloned()
    }

    /// Insert a new flow unless one with the same slug exists; returns the
    /// surviving definition.
    pub fn insert_flow_if_absent(&self, flow: Flow) -> Arc<FlowDefinition> {
        let mut flows = self.flows.write().expect("flow table poisoned");
        flows
            .entry(flow.flow_slug.clone())
            .or_insert_with(|| Arc::new(FlowDefinition::new(flow)))
            .clone()
    }

    /// Apply a mutation to a flow definition, committing the new snapshot
    /// only when the closure succeeds.
    pub fn update_flow<R>(
        &self,
        flow_slug: &str,
        mutate: impl FnOnce(&mut FlowDefinition) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut flows = self.flows.write().expect("flow table poisoned");
        let current = flows
            .get(flow_slug)
            .ok_or_else(|| EngineError::FlowNotFound(flow_slug.to_string()))?;
        let mut draft = FlowDefinition::clone(current);
        let result = mutate(&mut draft)?;
        flows.insert(flow_slug.to_string(), Arc::new(draft));
        Ok(result)
    }

    pub fn insert_run(&self, slot: RunSlot) -> EngineResult<Arc<AsyncMutex<RunSlot>>> {
        let run_id = slot.run.run_id;
        let mut runs = self.runs.write().expect("run table poisoned");
        if runs.contains_key(&run_id) {
            return Err(EngineError::RunAlreadyExists(run_id));
        }
        let arc = Arc::new(AsyncMutex::new(slot));
        runs.insert(run_id, arc.clone());
        Ok(arc)
    }

    pub fn run(&self, run_id: Uuid) -> Option<Arc<AsyncMutex<RunSlot>>> {
        let runs = self.runs.read().expect("run table poisoned");
        runs.get(&run_id).cloned()
    }

    pub fn run_ids(&self) -> Vec<Uuid> {
        let runs = self.runs.read().expect("run table poisoned");
        runs.keys().copied().collect()
    }

    /// Drop run slots and scrub their message index entries.
    pub fn remove_runs(&self, run_ids: &[Uuid]) {
        if run_ids.is_empty() {
            return;
        }
        {
            let mut runs = self.runs.write().expect("run table poisoned");
            for run_id in run_ids {
                runs.remove(run_id);
            }
        }
        let mut messages = self.messages.lock().expect("message index poisoned");
        messages.retain(|_, msg_ref| !run_ids.contains(&msg_ref.run_id));
    }

    pub fn index_messages(
        &self,
        queue: &str,
        entries: impl IntoIterator<Item = (i64, MessageRef)>,
    ) {
        let mut messages = self.messages.lock().expect("message index poisoned");
        for (msg_id, msg_ref) in entries {
            messages.insert((queue.to_string(), msg_id), msg_ref);
        }
    }

    pub fn unindex_messages(&self, queue: &str, msg_ids: &[i64]) {
        let mut messages = self.messages.lock().expect("message index poisoned");
        for msg_id in msg_ids {
            messages.remove(&(queue.to_string(), *msg_id));
        }
    }

    /// Resolve message ids to task references, preserving input order and
    /// skipping unknown ids.
    pub fn lookup_messages(&self, queue: &str, msg_ids: &[i64]) -> Vec<(i64, MessageRef)> {
        let messages = self.messages.lock().expect("message index poisoned");
        msg_ids
            .iter()
            .filter_map(|msg_id| {
                messages
                    .get(&(queue.to_string(), *msg_id))
                    .map(|msg_ref| (*msg_id, msg_ref.clone()))
            })
            .collect()
    }

    // ========================================================================
    // Worker registry
    // ========================================================================

    /// Insert or refresh a worker row, preserving the original `started_at`.
    pub fn upsert_worker(&self, row: WorkerRow) -> WorkerRow {
        let mut workers = self.workers.lock().expect("worker registry poisoned");
        match workers.get_mut(&row.worker_id) {
            Some(existing) => {
                existing.queue_name = row.queue_name;
                existing.function_name = row.function_name;
                existing.last_heartbeat_at = row.last_heartbeat_at;
                existing.clone()
            }
            None => {
                workers.insert(row.worker_id, row.clone());
                row
            }
        }
    }

    pub fn worker(&self, worker_id: Uuid) -> Option<WorkerRow> {
        let workers = self.workers.lock().expect("worker registry poisoned");
        workers.get(&worker_id).cloned()
    }

    pub fn prune_workers(&self, cutoff: DateTime<Utc>) -> usize {
        let mut workers = self.workers.lock().expect("worker registry poisoned");
        let before = workers.len();
        workers.retain(|_, row| row.last_heartbeat_at >= cutoff);
        before - workers.len()
    }
}
