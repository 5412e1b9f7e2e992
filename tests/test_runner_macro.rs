mod common;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tasker::{runner, AddTaskOptions, RunningTask, ThrownValue};

use common::*;

#[runner(operation = "double")]
async fn double_it(task: RunningTask) -> anyhow::Result<Value> {
    let n = task.data.as_i64().unwrap_or_default();
    task.logger.debug(format!("doubling {n}"));
    Ok(json!(n * 2))
}

#[runner]
async fn reject(task: RunningTask) -> anyhow::Result<Value> {
    Err(ThrownValue(json!({"code": 409, "input": task.data})).into())
}

#[test]
fn test_generated_operation_names() {
    assert_eq!(DoubleItRunner::OPERATION, "double");
    assert_eq!(RejectRunner::OPERATION, "reject");
}

#[tokio::test]
async fn test_generated_runners_execute() {
    let tasker = memory_tasker();
    tasker.assign_runner(DoubleItRunner::OPERATION, DoubleItRunner).unwrap();
    tasker.assign_runner(RejectRunner::OPERATION, RejectRunner).unwrap();
    tasker.start(None).await.unwrap();

    let doubled = queued(tasker.add_task(AddTaskOptions::new("double", json!(21))).await.unwrap());
    assert_eq!(tasker.wait_for_task_output_data(&doubled).await.unwrap(), json!(42));

    let rejected = queued(tasker.add_task(AddTaskOptions::new("reject", json!("x"))).await.unwrap());
    let failure = tasker.wait_for_task_output_data(&rejected).await.unwrap_err();
    assert!(matches!(
        failure,
        tasker::TaskerError::TaskFailed { ref error, .. } if *error == json!({"code": 409, "input": "x"})
    ));

    assert!(tasker.assign_runner("double", DoubleItRunner).is_err());
    tasker.stop().await.unwrap();
}
