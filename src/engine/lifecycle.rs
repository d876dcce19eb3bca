//! Run creation, the run document read and retention pruning.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::model::{Run, RunStatus, StepState, StepStatus, StepType};
use crate::store::RunSlot;

use super::Engine;

/// A run and all of its step states as one document.
#[derive(Debug, Clone)]
pub struct RunWithStates {
    pub run: Run,
    /// Step states in ascending `step_slug` order.
    pub step_states: Vec<StepState>,
}

impl Engine {
    /// Start a run of `flow_slug` against `input`.
    ///
    /// Resolves initial task counts where possible (single steps and root
    /// map steps), then immediately schedules whatever is ready. Flows with
    /// no steps, or whose steps all resolve to zero tasks, complete inside
    /// this call.
    pub async fn start_flow(
        &self,
        flow_slug: &str,
        input: Value,
        run_id: Option<Uuid>,
    ) -> EngineResult<Run> {
        let flow = self
            .store()
            .flow(flow_slug)
            .ok_or_else(|| EngineError::FlowNotFound(flow_slug.to_string()))?;
        if flow.has_root_map_steps() && !input.is_array() {
            return Err(EngineError::RootMapInputNotArray {
                flow_slug: flow_slug.to_string(),
            });
        }

        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();
        let run = Run {
            run_id,
            flow_slug: flow_slug.to_string(),
            status: RunStatus::Started,
            input: input.clone(),
            output: None,
            remaining_steps: flow.steps.len() as i32,
            started_at: now,
            completed_at: None,
            failed_at: None,
        };

        let mut step_states = BTreeMap::new();
        for step in &flow.steps {
            let initial_tasks = match step.step_type {
                StepType::Single => Some(1),
                StepType::Map if step.deps_count == 0 => {
                    Some(input.as_array().map(|a| a.len()).unwrap_or(0) as i32)
                }
                StepType::Map => None,
            };
            step_states.insert(
                step.step_slug.clone(),
                StepState {
                    run_id,
                    flow_slug: flow_slug.to_string(),
                    step_slug: step.step_slug.clone(),
                    status: StepStatus::Created,
                    remaining_deps: step.deps_count,
                    remaining_tasks: None,
                    initial_tasks,
                    error_message: None,
                    created_at: now,
                    started_at: None,
                    completed_at: None,
                    failed_at: None,
                },
            );
        }

        let slot = self.store().insert_run(RunSlot {
            run,
            step_states,
            step_tasks: BTreeMap::new(),
        })?;
        let mut guard = slot.lock().await;
        metrics::counter!("cairn_runs_started_total").increment(1);
        info!(run_id = %run_id, flow_slug, steps = flow.steps.len(), "run started");

        self.start_ready_steps_locked(&flow, &mut guard).await?;
        self.maybe_complete_run_locked(&flow, &mut guard);
        Ok(guard.run.clone())
    }

    /// Read a run and all of its step states as one document.
    pub async fn get_run_with_states(&self, run_id: Uuid) -> EngineResult<RunWithStates> {
        let slot = self
            .store()
            .run(run_id)
            .ok_or(EngineError::RunNotFound(run_id))?;
        let guard = slot.lock().await;
        Ok(RunWithStates {
            run: guard.run.clone(),
            step_states: guard.step_states.values().cloned().collect(),
        })
    }

    /// Delete terminal runs whose completion or failure is older than
    /// `older_than`, along with their message index entries. Returns the
    /// number of runs pruned.
    pub async fn prune_finished_runs(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut stale = Vec::new();
        for run_id in self.store().run_ids() {
            let Some(slot) = self.store().run(run_id) else {
                continue;
            };
            let guard = slot.lock().await;
            let terminal_at = match guard.run.status {
                RunStatus::Completed => guard.run.completed_at,
                RunStatus::Failed => guard.run.failed_at,
                RunStatus::Started => None,
            };
            if terminal_at.is_some_and(|at| at < cutoff) {
                stale.push(run_id);
            }
        }
        self.store().remove_runs(&stale);
        if !stale.is_empty() {
            info!(count = stale.len(), "pruned finished runs");
        }
        stale.len()
    }
}
