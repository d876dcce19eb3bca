//! Worker-facing two-phase task claim protocol.
//!
//! Phase 1 polls the queue for candidate messages without touching task
//! state. Phase 2 claims specific message ids: it increments attempt
//! counters, materializes each task's JSON input and extends message
//! visibility to cover the task timeout.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::EffectiveConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{RunStatus, Step, StepType, TaskStatus};
use crate::queue::{self, QueueMessage};
use crate::store::{FlowDefinition, MessageRef, RunSlot};

use super::Engine;

/// A task handed to a worker: identity plus the materialized JSON input.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub flow_slug: String,
    pub run_id: Uuid,
    pub step_slug: String,
    pub task_index: i32,
    pub attempts_count: i32,
    pub msg_id: i64,
    pub input: Value,
}

impl Engine {
    /// Phase 1: poll `queue_name` for up to `qty` messages within the time
    /// budget, hiding candidates for `vt_seconds`. Task state is not
    /// touched.
    pub async fn read_with_poll(
        &self,
        queue_name: &str,
        vt_seconds: i64,
        qty: usize,
        max_poll_seconds: u64,
        poll_interval_ms: u64,
    ) -> EngineResult<Vec<QueueMessage>> {
        let messages = queue::read_with_poll(
            self.queue(),
            queue_name,
            vt_seconds,
            qty,
            max_poll_seconds,
            poll_interval_ms,
        )
        .await?;
        Ok(messages)
    }

    /// Phase 1 with the engine-configured batch size, poll interval and
    /// budget; the candidate hold time is the configured visibility margin.
    pub async fn read_with_poll_defaults(
        &self,
        queue_name: &str,
    ) -> EngineResult<Vec<QueueMessage>> {
        let config = self.config().clone();
        self.read_with_poll(
            queue_name,
            config.visibility_margin_secs.max(1),
            config.read_batch_size,
            config.max_poll_seconds,
            config.poll_interval_ms,
        )
        .await
    }

    /// Phase 2: atomically claim tasks for the given message ids.
    ///
    /// Only tasks that are still `queued` and whose run has not failed are
    /// claimed; other ids are skipped. Runs are locked in ascending run-id
    /// order, and visibility of every claimed message is extended in one
    /// batched call.
    pub async fn start_tasks(
        &self,
        flow_slug: &str,
        msg_ids: &[i64],
        worker_id: Uuid,
    ) -> EngineResult<Vec<ClaimedTask>> {
        let flow = self
            .store()
            .flow(flow_slug)
            .ok_or_else(|| EngineError::FlowNotFound(flow_slug.to_string()))?;

        let mut by_run: BTreeMap<Uuid, Vec<(i64, MessageRef)>> = BTreeMap::new();
        for (msg_id, msg_ref) in self.store().lookup_messages(flow_slug, msg_ids) {
            by_run.entry(msg_ref.run_id).or_default().push((msg_id, msg_ref));
        }

        let mut claimed = Vec::new();
        let mut vt_entries: Vec<(i64, i64)> = Vec::new();
        for (run_id, entries) in by_run {
            let Some(slot) = self.store().run(run_id) else {
                continue;
            };
            let mut guard = slot.lock().await;
            if guard.run.status == RunStatus::Failed {
                continue;
            }
            for (msg_id, msg_ref) in entries {
                let Some(step) = flow.step(&msg_ref.step_slug) else {
                    continue;
                };
                let claimable = guard
                    .task(&msg_ref.step_slug, msg_ref.task_index)
                    .map(|t| t.status == TaskStatus::Queued)
                    .unwrap_or(false);
                if !claimable {
                    continue;
                }
                let input = build_task_input(&flow, &guard, step, msg_ref.task_index);
                let effective = EffectiveConfig::resolve(step, &flow.flow);

                let Some(task) = guard.task_mut(&msg_ref.step_slug, msg_ref.task_index) else {
                    continue;
                };
                task.attempts_count += 1;
                task.status = TaskStatus::Started;
                task.started_at = Some(Utc::now());
                task.last_worker_id = Some(worker_id);

                claimed.push(ClaimedTask {
                    flow_slug: flow_slug.to_string(),
                    run_id,
                    step_slug: msg_ref.step_slug.clone(),
                    task_index: msg_ref.task_index,
                    attempts_count: task.attempts_count,
                    msg_id,
                    input,
                });
                vt_entries.push((
                    msg_id,
                    effective.timeout as i64 + self.config().visibility_margin_secs,
                ));
            }
        }

        if !vt_entries.is_empty() {
            self.queue().set_vt_batch(flow_slug, &vt_entries).await?;
        }
        metrics::counter!("cairn_tasks_claimed_total").increment(claimed.len() as u64);
        debug!(
            flow_slug,
            worker_id = %worker_id,
            requested = msg_ids.len(),
            claimed = claimed.len(),
            "start_tasks"
        );
        Ok(claimed)
    }
}

/// Materialize the JSON input a worker receives for one task.
///
/// Non-map steps get the run input under `run` plus every dependency output
/// under the dependency's slug. Map steps get the raw element at
/// `task_index` of the fanned-out array: the run input for root maps, the
/// dependency's aggregated output for dependent maps.
fn build_task_input(
    flow: &FlowDefinition,
    slot: &RunSlot,
    step: &Step,
    task_index: i32,
) -> Value {
    match step.step_type {
        StepType::Map => {
            let deps = flow.deps(&step.step_slug);
            let source = if deps.is_empty() {
                slot.run.input.clone()
            } else {
                flow.step(&deps[0])
                    .map(|dep| slot.aggregated_step_output(dep))
                    .unwrap_or(Value::Null)
            };
            source
                .get(task_index as usize)
                .cloned()
                .unwrap_or(Value::Null)
        }
        StepType::Single => {
            let mut payload = serde_json::Map::new();
            payload.insert("run".to_string(), slot.run.input.clone());
            for dep_slug in flow.deps(&step.step_slug) {
                if let Some(dep) = flow.step(dep_slug) {
                    payload.insert(dep_slug.clone(), slot.aggregated_step_output(dep));
                }
            }
            Value::Object(payload)
        }
    }
}
