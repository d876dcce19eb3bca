//! Tests for task retry, backoff and attempt exhaustion.
//!
//! The retry loop is queue-driven: a failed task goes back to `queued` and
//! its message is re-hidden for the backoff delay, so redelivery is what
//! triggers the next attempt.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use uuid::Uuid;

use cairn::{
    ClaimedTask, Engine, EngineConfig, MemoryQueue, RunStatus, StepOptions, StepStatus, StepType,
    TaskStatus,
};

fn setup() -> (Engine, MemoryQueue) {
    let queue = MemoryQueue::new();
    let engine = Engine::with_config(Arc::new(queue.clone()), EngineConfig::test_config());
    (engine, queue)
}

async fn claim_all(engine: &Engine, flow: &str) -> Result<Vec<ClaimedTask>> {
    let messages = engine.read_with_poll(flow, 5, 32, 0, 10).await?;
    let msg_ids: Vec<i64> = messages.iter().map(|m| m.msg_id).collect();
    Ok(engine.start_tasks(flow, &msg_ids, Uuid::new_v4()).await?)
}

#[tokio::test]
async fn failed_task_requeues_until_attempts_are_exhausted() -> Result<()> {
    let (engine, queue) = setup();
    // base_delay 0 keeps the retried message immediately visible.
    engine.create_flow("flaky", Some(2), Some(0), None)?;
    engine.add_step("flaky", "work", &[], StepOptions::default(), StepType::Single)?;

    let run = engine.start_flow("flaky", json!(null), None).await?;

    let tasks = claim_all(&engine, "flaky").await?;
    assert_eq!(tasks[0].attempts_count, 1);
    let rows = engine
        .fail_task(run.run_id, "work", 0, "first failure")
        .await?;
    assert_eq!(rows[0].status, TaskStatus::Queued, "attempt 1 of 2 retries");
    assert!(rows[0].started_at.is_none());
    assert_eq!(rows[0].error_message.as_deref(), Some("first failure"));

    let doc = engine.get_run_with_states(run.run_id).await?;
    assert_eq!(doc.run.status, RunStatus::Started);

    let tasks = claim_all(&engine, "flaky").await?;
    assert_eq!(tasks[0].attempts_count, 2);
    let rows = engine
        .fail_task(run.run_id, "work", 0, "second failure")
        .await?;
    assert_eq!(rows[0].status, TaskStatus::Failed, "attempts exhausted");

    let doc = engine.get_run_with_states(run.run_id).await?;
    assert_eq!(doc.run.status, RunStatus::Failed);
    assert!(doc.run.failed_at.is_some());
    let state = &doc.step_states[0];
    assert_eq!(state.status, StepStatus::Failed);
    assert_eq!(state.error_message.as_deref(), Some("second failure"));
    assert_eq!(queue.pending("flaky"), 0, "terminal failure archives the message");
    assert!(!queue.archived("flaky").is_empty());
    Ok(())
}

#[tokio::test]
async fn step_level_max_attempts_overrides_the_flow_default() -> Result<()> {
    let (engine, _queue) = setup();
    engine.create_flow("strict", Some(5), Some(0), None)?;
    engine.add_step(
        "strict",
        "once",
        &[],
        StepOptions {
            max_attempts: Some(1),
            ..StepOptions::default()
        },
        StepType::Single,
    )?;

    let run = engine.start_flow("strict", json!(null), None).await?;
    claim_all(&engine, "strict").await?;
    let rows = engine.fail_task(run.run_id, "once", 0, "boom").await?;
    assert_eq!(rows[0].status, TaskStatus::Failed, "no retries at one attempt");

    let doc = engine.get_run_with_states(run.run_id).await?;
    assert_eq!(doc.run.status, RunStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn retry_backoff_hides_the_message_for_the_delay() -> Result<()> {
    let (engine, queue) = setup();
    engine.create_flow("slow", Some(3), Some(60), None)?;
    engine.add_step("slow", "work", &[], StepOptions::default(), StepType::Single)?;

    let run = engine.start_flow("slow", json!(null), None).await?;
    claim_all(&engine, "slow").await?;
    engine.fail_task(run.run_id, "work", 0, "transient").await?;

    let doc = engine.get_run_with_states(run.run_id).await?;
    assert_eq!(doc.run.status, RunStatus::Started);
    assert_eq!(queue.pending("slow"), 1);
    assert_eq!(queue.visible("slow"), 0, "hidden for the backoff delay");
    assert!(claim_all(&engine, "slow").await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn fail_task_on_an_unclaimed_task_is_a_noop() -> Result<()> {
    let (engine, _queue) = setup();
    engine.create_flow("idle", None, None, None)?;
    engine.add_step("idle", "work", &[], StepOptions::default(), StepType::Single)?;

    let run = engine.start_flow("idle", json!(null), None).await?;
    let rows = engine.fail_task(run.run_id, "work", 0, "never started").await?;
    assert_eq!(rows[0].status, TaskStatus::Queued, "row returned untouched");
    assert_eq!(rows[0].attempts_count, 0);
    Ok(())
}

#[tokio::test]
async fn exhaustion_in_one_branch_kills_sibling_work() -> Result<()> {
    let (engine, queue) = setup();
    engine.create_flow("branches", Some(1), Some(0), None)?;
    engine.add_step("branches", "left", &[], StepOptions::default(), StepType::Single)?;
    engine.add_step("branches", "right", &[], StepOptions::default(), StepType::Single)?;

    let run = engine.start_flow("branches", json!(null), None).await?;
    let tasks = claim_all(&engine, "branches").await?;
    assert_eq!(tasks.len(), 2);

    engine.fail_task(run.run_id, "left", 0, "fatal").await?;
    let doc = engine.get_run_with_states(run.run_id).await?;
    assert_eq!(doc.run.status, RunStatus::Failed);
    assert_eq!(queue.pending("branches"), 0, "sibling message archived");

    // A zombie worker reporting the sibling's failure lands on the
    // idempotent terminal path.
    let rows = engine
        .fail_task(run.run_id, "right", 0, "worker gave up")
        .await?;
    assert_eq!(rows[0].status, TaskStatus::Failed);
    let again = engine
        .fail_task(run.run_id, "right", 0, "worker gave up twice")
        .await?;
    assert_eq!(again[0].error_message.as_deref(), Some("worker gave up"));
    Ok(())
}

#[tokio::test]
async fn redelivered_message_for_a_started_task_is_not_reclaimed() -> Result<()> {
    let queue = MemoryQueue::new();
    let mut config = EngineConfig::test_config();
    config.visibility_margin_secs = 0;
    let engine = Engine::with_config(Arc::new(queue.clone()), config);

    engine.create_flow("crashy", None, None, None)?;
    engine.add_step(
        "crashy",
        "work",
        &[],
        StepOptions {
            // Zero timeout plus zero margin: the claimed message becomes
            // visible again immediately, simulating a worker crash window.
            timeout: Some(0),
            ..StepOptions::default()
        },
        StepType::Single,
    )?;

    engine.start_flow("crashy", json!(null), None).await?;
    let first = claim_all(&engine, "crashy").await?;
    assert_eq!(first.len(), 1);

    // The queue redelivers (at-least-once), but phase 2 only claims tasks
    // that are still queued.
    let messages = engine.read_with_poll("crashy", 0, 32, 0, 10).await?;
    assert_eq!(messages.len(), 1, "message redelivered after visibility lapse");
    assert!(messages[0].read_ct >= 2);
    let msg_ids: Vec<i64> = messages.iter().map(|m| m.msg_id).collect();
    let reclaimed = engine.start_tasks("crashy", &msg_ids, Uuid::new_v4()).await?;
    assert!(reclaimed.is_empty());
    Ok(())
}
