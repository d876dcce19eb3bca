//! Queue contract conformance for the in-memory implementation.
//!
//! These are the behaviors the engine leans on: at-least-once redelivery
//! after a visibility lapse, delayed sends, and the polling read.

use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use cairn::queue::{MemoryQueue, WorkQueue, read_with_poll};

#[tokio::test]
async fn message_redelivers_after_the_visibility_timeout_lapses() -> Result<()> {
    let queue = MemoryQueue::new();
    queue.send("q", &json!({"job": 1}), 0).await?;

    let first = queue.read("q", 1, 10).await?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].read_ct, 1);
    assert!(queue.read("q", 1, 10).await?.is_empty());

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let second = queue.read("q", 1, 10).await?;
    assert_eq!(second.len(), 1, "unarchived message must redeliver");
    assert_eq!(second[0].msg_id, first[0].msg_id);
    assert_eq!(second[0].read_ct, 2);
    Ok(())
}

#[tokio::test]
async fn read_with_poll_waits_for_a_delayed_message() -> Result<()> {
    let queue = MemoryQueue::new();
    queue.send("q", &json!("later"), 1).await?;
    assert!(queue.read("q", 5, 10).await?.is_empty());

    let messages = read_with_poll(&queue, "q", 5, 10, 3, 50).await?;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload, json!("later"));
    Ok(())
}

#[tokio::test]
async fn read_with_poll_returns_empty_once_the_budget_lapses() -> Result<()> {
    let queue = MemoryQueue::new();
    let messages = read_with_poll(&queue, "empty", 5, 10, 0, 10).await?;
    assert!(messages.is_empty());
    Ok(())
}

#[tokio::test]
async fn archived_messages_never_redeliver() -> Result<()> {
    let queue = MemoryQueue::new();
    let msg_id = queue.send("q", &json!("done"), 0).await?;
    let read = queue.read("q", 1, 10).await?;
    assert_eq!(read.len(), 1);

    queue.archive("q", &[msg_id]).await?;
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(queue.read("q", 1, 10).await?.is_empty());
    assert_eq!(queue.archived("q").len(), 1);
    Ok(())
}

#[tokio::test]
async fn set_vt_batch_updates_each_entry_independently() -> Result<()> {
    let queue = MemoryQueue::new();
    let a = queue.send("q", &json!("a"), 0).await?;
    let b = queue.send("q", &json!("b"), 0).await?;
    let read = queue.read("q", 60, 10).await?;
    assert_eq!(read.len(), 2);

    // Surface `a` immediately, keep `b` hidden.
    queue.set_vt_batch("q", &[(a, 0), (b, 120)]).await?;
    let visible = queue.read("q", 60, 10).await?;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].msg_id, a);
    Ok(())
}
