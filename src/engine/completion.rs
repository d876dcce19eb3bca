//! Task completion, task failure and run completion.
//!
//! These are the transitions that drive a run forward: every call locks the
//! run slot once and performs all of its counter updates, dependent-map
//! resolution, scheduling and run-completion checking inside that single
//! transaction.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EffectiveConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{RunStatus, StepStatus, StepTask, StepType, TaskStatus};
use crate::retry::retry_delay;
use crate::store::{FlowDefinition, RunSlot};

use super::Engine;

impl Engine {
    /// Record a task's output and advance everything it unblocks.
    ///
    /// Returns the updated task row; an empty result means the call failed
    /// the run (type violation). Calls against an already-failed run, or
    /// for a task that is already terminal, return the current row
    /// untouched.
    pub async fn complete_task(
        &self,
        run_id: Uuid,
        step_slug: &str,
        task_index: i32,
        output: Value,
    ) -> EngineResult<Vec<StepTask>> {
        let slot = self
            .store()
            .run(run_id)
            .ok_or(EngineError::RunNotFound(run_id))?;
        let mut guard = slot.lock().await;
        let flow = self
            .store()
            .flow(&guard.run.flow_slug)
            .ok_or_else(|| EngineError::FlowNotFound(guard.run.flow_slug.clone()))?;

        if guard.run.status == RunStatus::Failed {
            return Ok(guard.task(step_slug, task_index).cloned().into_iter().collect());
        }

        let step = flow
            .step(step_slug)
            .ok_or_else(|| EngineError::StepNotFound {
                flow_slug: flow.flow.flow_slug.clone(),
                step_slug: step_slug.to_string(),
            })?;
        let status = guard
            .task(step_slug, task_index)
            .map(|t| t.status)
            .ok_or_else(|| EngineError::TaskNotFound {
                run_id,
                step_slug: step_slug.to_string(),
                task_index,
            })?;
        if status != TaskStatus::Started {
            // Terminal tasks make repeated completions no-ops; queued tasks
            // were never claimed and cannot complete.
            return Ok(guard.task(step_slug, task_index).cloned().into_iter().collect());
        }

        // A single step feeding an unresolved map step must produce the
        // array the map will fan out over. Anything else poisons the whole
        // run.
        if step.step_type == StepType::Single && !output.is_array() {
            let feeds_unresolved_map = flow.dependents(step_slug).iter().any(|dependent| {
                flow.step(dependent)
                    .map(|s| s.step_type == StepType::Map)
                    .unwrap_or(false)
                    && guard
                        .state(dependent)
                        .map(|s| s.initial_tasks.is_none())
                        .unwrap_or(false)
            });
            if feeds_unresolved_map {
                let message = format!(
                    "step {step_slug:?} feeds a map step but produced non-array output"
                );
                self.fail_run_locked(&flow, &mut guard, step_slug, Some(task_index), &message)
                    .await?;
                return Ok(Vec::new());
            }
        }

        let now = Utc::now();
        let mut archived_msg = None;
        if let Some(task) = guard.task_mut(step_slug, task_index) {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(now);
            task.output = Some(output.clone());
            archived_msg = task.message_id;
        }
        if let Some(msg_id) = archived_msg {
            self.queue().archive(&flow.flow.flow_slug, &[msg_id]).await?;
            self.store().unindex_messages(&flow.flow.flow_slug, &[msg_id]);
        }
        metrics::counter!("cairn_tasks_completed_total").increment(1);

        let step_completed = match guard.state_mut(step_slug) {
            Some(state) => {
                state.remaining_tasks = state.remaining_tasks.map(|n| n - 1);
                if state.remaining_tasks == Some(0) {
                    state.status = StepStatus::Completed;
                    state.completed_at = Some(now);
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if step_completed {
            guard.run.remaining_steps -= 1;
            // How many tasks a dependent map step fans out over: the length
            // of a single step's output array, or the task count of a map
            // step.
            let resolved_tasks = match step.step_type {
                StepType::Single => output.as_array().map(|a| a.len() as i32),
                StepType::Map => Some(guard.completed_task_count(step_slug)),
            };
            for dependent_slug in flow.dependents(step_slug) {
                let dependent_is_map = flow
                    .step(dependent_slug)
                    .map(|s| s.step_type == StepType::Map)
                    .unwrap_or(false);
                let Some(dependent) = guard.state_mut(dependent_slug) else {
                    continue;
                };
                dependent.remaining_deps -= 1;
                if dependent_is_map && dependent.initial_tasks.is_none() {
                    dependent.initial_tasks = resolved_tasks;
                }
            }
            debug!(
                run_id = %run_id,
                step_slug = %step_slug,
                "step completed"
            );
        }

        self.start_ready_steps_locked(&flow, &mut guard).await?;
        self.maybe_complete_run_locked(&flow, &mut guard);

        Ok(guard.task(step_slug, task_index).cloned().into_iter().collect())
    }

    /// Record a task failure: requeue with backoff while attempts remain,
    /// otherwise fail the task, its step and the whole run.
    pub async fn fail_task(
        &self,
        run_id: Uuid,
        step_slug: &str,
        task_index: i32,
        error_message: &str,
    ) -> EngineResult<Vec<StepTask>> {
        let slot = self
            .store()
            .run(run_id)
            .ok_or(EngineError::RunNotFound(run_id))?;
        let mut guard = slot.lock().await;
        let flow = self
            .store()
            .flow(&guard.run.flow_slug)
            .ok_or_else(|| EngineError::FlowNotFound(guard.run.flow_slug.clone()))?;

        if guard.run.status == RunStatus::Failed {
            // The run is already dead: force the straggler task to a
            // terminal state and archive its message so it stops
            // redelivering.
            let now = Utc::now();
            let mut archived_msg = None;
            let row = match guard.task_mut(step_slug, task_index) {
                Some(task) => {
                    if !task.status.is_terminal() {
                        task.status = TaskStatus::Failed;
                        task.failed_at = Some(now);
                        task.error_message = Some(error_message.to_string());
                    }
                    archived_msg = task.message_id;
                    Some(task.clone())
                }
                None => None,
            };
            if let Some(msg_id) = archived_msg {
                self.queue().archive(&flow.flow.flow_slug, &[msg_id]).await?;
                self.store().unindex_messages(&flow.flow.flow_slug, &[msg_id]);
            }
            return Ok(row.into_iter().collect());
        }

        let step = flow
            .step(step_slug)
            .ok_or_else(|| EngineError::StepNotFound {
                flow_slug: flow.flow.flow_slug.clone(),
                step_slug: step_slug.to_string(),
            })?;
        let (status, attempts_count) = guard
            .task(step_slug, task_index)
            .map(|t| (t.status, t.attempts_count))
            .ok_or_else(|| EngineError::TaskNotFound {
                run_id,
                step_slug: step_slug.to_string(),
                task_index,
            })?;
        if status != TaskStatus::Started {
            return Ok(guard.task(step_slug, task_index).cloned().into_iter().collect());
        }

        let effective = EffectiveConfig::resolve(step, &flow.flow);
        if attempts_count < effective.max_attempts {
            // Retry N waits base * 2^(N-1): the first failure backs off by
            // exactly the base delay.
            let delay = retry_delay(
                effective.base_delay as i64,
                attempts_count.saturating_sub(1).max(0) as u32,
            );
            let mut requeued_msg = None;
            if let Some(task) = guard.task_mut(step_slug, task_index) {
                task.status = TaskStatus::Queued;
                task.started_at = None;
                task.error_message = Some(error_message.to_string());
                requeued_msg = task.message_id;
            }
            if let Some(msg_id) = requeued_msg {
                self.queue().set_vt(&flow.flow.flow_slug, msg_id, delay).await?;
            }
            metrics::counter!("cairn_task_retries_total").increment(1);
            warn!(
                run_id = %run_id,
                step_slug = %step_slug,
                task_index,
                attempts = attempts_count,
                delay,
                "task requeued for retry"
            );
        } else {
            self.fail_run_locked(&flow, &mut guard, step_slug, Some(task_index), error_message)
                .await?;
        }

        Ok(guard.task(step_slug, task_index).cloned().into_iter().collect())
    }

    /// Fail the run and everything attached to it: the offending task and
    /// step get the error message, and every in-flight message for the run
    /// is archived so workers stop receiving work for a dead run.
    pub(crate) async fn fail_run_locked(
        &self,
        flow: &FlowDefinition,
        slot: &mut RunSlot,
        step_slug: &str,
        task_index: Option<i32>,
        message: &str,
    ) -> EngineResult<()> {
        let in_flight = slot.in_flight_message_ids();
        let now = Utc::now();

        if let Some(task_index) = task_index {
            if let Some(task) = slot.task_mut(step_slug, task_index) {
                task.status = TaskStatus::Failed;
                task.failed_at = Some(now);
                task.error_message = Some(message.to_string());
            }
        }
        if let Some(state) = slot.state_mut(step_slug) {
            state.status = StepStatus::Failed;
            state.failed_at = Some(now);
            state.error_message = Some(message.to_string());
        }
        slot.run.status = RunStatus::Failed;
        slot.run.failed_at = Some(now);

        if !in_flight.is_empty() {
            self.queue().archive(&flow.flow.flow_slug, &in_flight).await?;
            self.store().unindex_messages(&flow.flow.flow_slug, &in_flight);
        }
        metrics::counter!("cairn_runs_failed_total").increment(1);
        error!(
            run_id = %slot.run.run_id,
            step_slug = %step_slug,
            message,
            archived = in_flight.len(),
            "run failed"
        );
        Ok(())
    }

    /// Complete the run once no steps remain, aggregating leaf-step outputs
    /// into the run output.
    pub(crate) fn maybe_complete_run_locked(&self, flow: &FlowDefinition, slot: &mut RunSlot) {
        if slot.run.remaining_steps != 0 || slot.run.status != RunStatus::Started {
            return;
        }
        let mut output = serde_json::Map::new();
        for step in flow.leaf_steps() {
            let completed = slot
                .state(&step.step_slug)
                .map(|s| s.status == StepStatus::Completed)
                .unwrap_or(false);
            if completed {
                output.insert(step.step_slug.clone(), slot.aggregated_step_output(step));
            }
        }
        slot.run.status = RunStatus::Completed;
        slot.run.completed_at = Some(Utc::now());
        slot.run.output = Some(Value::Object(output));
        metrics::counter!("cairn_runs_completed_total").increment(1);
        info!(run_id = %slot.run.run_id, "run completed");
    }
}
