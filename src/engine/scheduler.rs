//! Readiness scan, taskless cascade and task dispatch.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use crate::config::EffectiveConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{RunStatus, StepStatus, StepTask, StepType, TaskMessage, TaskStatus};
use crate::queue::QueueError;
use crate::store::{FlowDefinition, MessageRef, RunSlot};

use super::Engine;

/// Iteration bound for the taskless cascade. A well-formed DAG settles in at
/// most `steps` iterations; exceeding the bound means the graph is
/// malformed and the engine must abort rather than spin.
pub(crate) const CASCADE_MAX_ITERATIONS: u32 = 50;

impl Engine {
    /// Start every step of `run_id` whose dependencies are satisfied.
    ///
    /// No-op when the run has already failed. Taskless (empty-map) steps are
    /// completed without dispatching any work; all other ready steps are
    /// started and get one queue message per task.
    pub async fn start_ready_steps(&self, run_id: Uuid) -> EngineResult<()> {
        let slot = self
            .store()
            .run(run_id)
            .ok_or(EngineError::RunNotFound(run_id))?;
        let mut guard = slot.lock().await;
        let flow = self
            .store()
            .flow(&guard.run.flow_slug)
            .ok_or_else(|| EngineError::FlowNotFound(guard.run.flow_slug.clone()))?;
        self.start_ready_steps_locked(&flow, &mut guard).await?;
        self.maybe_complete_run_locked(&flow, &mut guard);
        Ok(())
    }

    /// Scheduler body, run inside an already-held run transaction.
    pub(crate) async fn start_ready_steps_locked(
        &self,
        flow: &FlowDefinition,
        slot: &mut RunSlot,
    ) -> EngineResult<()> {
        if slot.run.status == RunStatus::Failed {
            return Ok(());
        }
        self.cascade_taskless_locked(flow, slot)?;

        // BTreeMap iteration gives the fixed step_slug order every caller
        // observes.
        let ready: Vec<(String, i32)> = slot
            .step_states
            .values()
            .filter(|s| s.status == StepStatus::Created && s.remaining_deps == 0)
            .filter_map(|s| {
                s.initial_tasks
                    .filter(|count| *count > 0)
                    .map(|count| (s.step_slug.clone(), count))
            })
            .collect();

        for (step_slug, task_count) in ready {
            let step = flow
                .step(&step_slug)
                .ok_or_else(|| EngineError::StepNotFound {
                    flow_slug: flow.flow.flow_slug.clone(),
                    step_slug: step_slug.clone(),
                })?;
            let effective = EffectiveConfig::resolve(step, &flow.flow);
            let now = Utc::now();

            if let Some(state) = slot.state_mut(&step_slug) {
                state.status = StepStatus::Started;
                state.started_at = Some(now);
                state.remaining_tasks = Some(task_count);
            }

            let payloads = (0..task_count)
                .map(|task_index| {
                    serde_json::to_value(TaskMessage {
                        flow_slug: flow.flow.flow_slug.clone(),
                        run_id: slot.run.run_id,
                        step_slug: step_slug.clone(),
                        task_index,
                    })
                })
                .collect::<Result<Vec<Value>, _>>()
                .map_err(QueueError::from)?;
            let msg_ids = self
                .queue()
                .send_batch(
                    &flow.flow.flow_slug,
                    &payloads,
                    effective.start_delay as i64,
                )
                .await?;

            for (task_index, msg_id) in msg_ids.iter().enumerate() {
                slot.step_tasks.insert(
                    (step_slug.clone(), task_index as i32),
                    StepTask {
                        run_id: slot.run.run_id,
                        flow_slug: flow.flow.flow_slug.clone(),
                        step_slug: step_slug.clone(),
                        task_index: task_index as i32,
                        status: TaskStatus::Queued,
                        attempts_count: 0,
                        message_id: Some(*msg_id),
                        last_worker_id: None,
                        output: None,
                        error_message: None,
                        queued_at: now,
                        started_at: None,
                        completed_at: None,
                        failed_at: None,
                    },
                );
            }
            self.store().index_messages(
                &flow.flow.flow_slug,
                msg_ids.iter().enumerate().map(|(task_index, msg_id)| {
                    (
                        *msg_id,
                        MessageRef {
                            run_id: slot.run.run_id,
                            step_slug: step_slug.clone(),
                            task_index: task_index as i32,
                        },
                    )
                }),
            );

            metrics::counter!("cairn_tasks_dispatched_total").increment(task_count as u64);
            debug!(
                run_id = %slot.run.run_id,
                step_slug = %step_slug,
                tasks = task_count,
                start_delay = effective.start_delay,
                "step started"
            );
        }
        Ok(())
    }

    /// Complete `initial_tasks = 0` steps without dispatching work.
    ///
    /// Fixed-point loop: completing an empty map step can zero out the task
    /// count of a downstream map step, which then completes on the next
    /// pass. Bounded by [`CASCADE_MAX_ITERATIONS`].
    pub(crate) fn cascade_taskless_locked(
        &self,
        flow: &FlowDefinition,
        slot: &mut RunSlot,
    ) -> EngineResult<()> {
        for _ in 0..CASCADE_MAX_ITERATIONS {
            let taskless: Vec<String> = slot
                .step_states
                .values()
                .filter(|s| {
                    s.status == StepStatus::Created
                        && s.remaining_deps == 0
                        && s.initial_tasks == Some(0)
                })
                .map(|s| s.step_slug.clone())
                .collect();
            if taskless.is_empty() {
                return Ok(());
            }

            let now = Utc::now();
            for step_slug in taskless {
                if let Some(state) = slot.state_mut(&step_slug) {
                    state.status = StepStatus::Completed;
                    state.remaining_tasks = Some(0);
                    state.completed_at = Some(now);
                }
                slot.run.remaining_steps -= 1;

                for dependent_slug in flow.dependents(&step_slug) {
                    let dependent_is_map = flow
                        .step(dependent_slug)
                        .map(|s| s.step_type == StepType::Map)
                        .unwrap_or(false);
                    let Some(dependent) = slot.state_mut(dependent_slug) else {
                        continue;
                    };
                    dependent.remaining_deps -= 1;
                    if dependent_is_map && dependent.initial_tasks.is_none() {
                        dependent.initial_tasks = Some(0);
                    }
                }
                debug!(
                    run_id = %slot.run.run_id,
                    step_slug = %step_slug,
                    "taskless step completed"
                );
            }
        }

        error!(
            run_id = %slot.run.run_id,
            limit = CASCADE_MAX_ITERATIONS,
            "taskless cascade did not settle"
        );
        Err(EngineError::CascadeLimitExceeded {
            run_id: slot.run.run_id,
            limit: CASCADE_MAX_ITERATIONS,
        })
    }
}
