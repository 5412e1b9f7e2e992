#![allow(dead_code)]

use std::time::Duration;

use serde_json::{json, Value};
use tasker::{AddTaskOutcome, GetTaskOptions, RunningTask, Task, TaskStatus, Tasker};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn memory_tasker() -> Tasker {
    init_tracing();
    Tasker::builder().build().unwrap()
}

pub fn queued(outcome: AddTaskOutcome) -> String {
    match outcome {
        AddTaskOutcome::Queued { uuid } => uuid,
        AddTaskOutcome::Skipped => panic!("task was skipped"),
    }
}

pub fn task(tasker: &Tasker, uuid: &str) -> Task {
    tasker.get_task(uuid, GetTaskOptions::default()).unwrap()
}

/// Polls until `check` holds, failing the test after five seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_status(tasker: &Tasker, uuid: &str, status: TaskStatus) {
    eventually(&format!("{uuid} to be {status}"), || task(tasker, uuid).status == status).await;
}

pub async fn sum(task: RunningTask) -> anyhow::Result<Value> {
    let a = task.data[0].as_i64().unwrap_or_default();
    let b = task.data[1].as_i64().unwrap_or_default();
    task.logger.info(format!("adding {a} and {b}"));
    Ok(json!(a + b))
}

/// Waits for abort and unwinds with the abort error.
pub async fn until_aborted(task: RunningTask) -> anyhow::Result<Value> {
    task.logger.info("waiting for abort");
    task.abort.aborted().await;
    task.abort.check()?;
    Ok(Value::Null)
}

/// Exactly one outcome field is set, and timestamps are ordered.
pub fn assert_ended_consistently(task: &Task) {
    assert!(task.status.is_terminal(), "{} is not terminal", task.uuid);
    let outcomes = [&task.result, &task.error, &task.abort_reason]
        .iter()
        .filter(|field| field.is_some())
        .count();
    assert_eq!(outcomes, 1, "outcome fields of {}", task.uuid);

    let ended = task.ended_at.expect("endedAt set");
    assert!(ended >= task.created_at);
    if let Some(started) = task.started_at {
        assert!(started >= task.created_at);
        assert!(ended >= started);
    }
}
