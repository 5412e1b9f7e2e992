//! Sweep ordering, admission conditions and run conditions.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tasker::{
    runner_fn, AddTaskOptions, ConditionError, ConditionEvaluator, ConditionHelpers,
    FindTasksOptions, RunningTask, SortSpec, TaskStatus, Tasker, TaskerEvent,
};
use tokio::time::timeout;

use common::*;

#[tokio::test]
async fn test_higher_priority_runs_first() {
    let tasker = memory_tasker();
    tasker.assign_runner("sum", runner_fn(sum)).unwrap();

    let a = queued(
        tasker
            .add_task(AddTaskOptions::new("sum", json!([1, 0])).priority(1))
            .await
            .unwrap(),
    );
    let b = queued(
        tasker
            .add_task(AddTaskOptions::new("sum", json!([2, 0])).priority(5))
            .await
            .unwrap(),
    );

    let mut events = tasker.subscribe();
    tasker.start(None).await.unwrap();

    let mut started = Vec::new();
    while started.len() < 2 {
        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        if let TaskerEvent::TaskRun { task } = event {
            started.push(task.uuid);
        }
    }
    assert_eq!(started, vec![b, a]);
    tasker.stop().await.unwrap();
}

#[tokio::test]
async fn test_run_condition_serializes_per_resource() {
    let tasker = memory_tasker();
    let windows: Arc<Mutex<Vec<(Instant, Instant)>>> = Arc::default();

    let recorded = Arc::clone(&windows);
    tasker
        .assign_runner(
            "read",
            runner_fn(move |_task: RunningTask| {
                let recorded = Arc::clone(&recorded);
                async move {
                    let start = Instant::now();
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    recorded.lock().unwrap().push((start, Instant::now()));
                    Ok::<_, anyhow::Error>(Value::Null)
                }
            }),
        )
        .unwrap();

    let condition = "!hasTask({status: 'running', 'data.book': task.data.book})";
    let mut uuids = Vec::new();
    for _ in 0..3 {
        let options = AddTaskOptions::new("read", json!({"book": "moby"})).run_condition(condition);
        uuids.push(queued(tasker.add_task(options).await.unwrap()));
    }

    tasker.start(None).await.unwrap();
    for uuid in &uuids {
        timeout(Duration::from_secs(5), tasker.wait_for_task_output_data(uuid))
            .await
            .unwrap()
            .unwrap();
    }

    let mut windows = windows.lock().unwrap().clone();
    assert_eq!(windows.len(), 3);
    windows.sort();
    for pair in windows.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "runs overlapped: {pair:?}");
    }
    tasker.stop().await.unwrap();
}

#[tokio::test]
async fn test_add_condition_skips_duplicates() {
    let tasker = memory_tasker();
    let condition = "!hasTask({operation: task.operation, status: 'queued'})";

    let first = tasker
        .add_task(AddTaskOptions::new("sync", Value::Null).add_condition(condition))
        .await
        .unwrap();
    assert!(!first.is_skipped());

    let second = tasker
        .add_task(AddTaskOptions::new("sync", Value::Null).add_condition(condition))
        .await
        .unwrap();
    assert!(second.is_skipped());

    let broken = tasker
        .add_task(AddTaskOptions::new("sync", Value::Null).add_condition("missing.field"))
        .await
        .unwrap();
    assert!(broken.is_skipped());

    let found = tasker.find_tasks(&json!({"operation": "sync"}), FindTasksOptions::default()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(Some(found[0].uuid.as_str()), first.uuid());
}

#[tokio::test]
async fn test_concurrent_admissions_apply_in_order() {
    let tasker = memory_tasker();
    let condition = "countTasks({operation: 'limited'}) < 2";

    let submissions = (0..5).map(|i| {
        let tasker = tasker.clone();
        tokio::spawn(async move {
            tasker
                .add_task(AddTaskOptions::new("limited", json!(i)).add_condition(condition))
                .await
                .unwrap()
        })
    });
    let outcomes = futures::future::join_all(submissions).await;
    let admitted = outcomes.iter().filter(|o| !o.as_ref().unwrap().is_skipped()).count();
    assert_eq!(admitted, 2);
}

#[tokio::test]
async fn test_failing_run_condition_counts_as_rejected() {
    let tasker = memory_tasker();
    tasker.assign_runner("sum", runner_fn(sum)).unwrap();

    let broken = queued(
        tasker
            .add_task(
                AddTaskOptions::new("sum", json!([1, 1]))
                    .priority(10)
                    .run_condition("noSuchHelper(1)"),
            )
            .await
            .unwrap(),
    );
    let follower = queued(
        tasker
            .add_task(
                AddTaskOptions::new("sum", json!([2, 2]))
                    .run_condition(format!("beforeQueuedTasksUuids.length === 1 && beforeQueuedTasksUuids[0] === '{broken}'")),
            )
            .await
            .unwrap(),
    );

    tasker.start(None).await.unwrap();
    assert_eq!(tasker.wait_for_task_output_data(&follower).await.unwrap(), json!(4));
    assert_eq!(task(&tasker, &broken).status, TaskStatus::Queued);

    tasker.abort_task(&broken, None).unwrap();
    assert_eq!(task(&tasker, &broken).status, TaskStatus::Aborted);
    tasker.stop().await.unwrap();
}

#[tokio::test]
async fn test_runner_assigned_later_picks_up_queued_tasks() {
    let tasker = memory_tasker();
    tasker.start(None).await.unwrap();

    let uuid = queued(tasker.add_task(AddTaskOptions::new("sum", json!([20, 22]))).await.unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(task(&tasker, &uuid).status, TaskStatus::Queued);

    tasker.assign_runner("sum", runner_fn(sum)).unwrap();
    assert_eq!(tasker.wait_for_task_output_data(&uuid).await.unwrap(), json!(42));
    tasker.stop().await.unwrap();
}

#[tokio::test]
async fn test_find_tasks_sort_skip_limit() {
    let tasker = memory_tasker();
    for priority in [3, 1, 2] {
        tasker
            .add_task(AddTaskOptions::new("idle", json!(priority)).priority(priority))
            .await
            .unwrap();
    }

    let mut options = FindTasksOptions::sorted(SortSpec::new().desc("priority"));
    options.skip = 1;
    options.limit = Some(1);
    let page = tasker.find_tasks(&json!({"status": "queued"}), options).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].priority, 2);

    let high = tasker
        .find_tasks(&json!({"priority": {"$gte": 2}}), FindTasksOptions::default())
        .unwrap();
    assert_eq!(high.len(), 2);
}

/// Admits only tasks whose operation is listed in the expression.
struct AllowList;

impl ConditionEvaluator for AllowList {
    fn evaluate(
        &self,
        expression: &str,
        context: &Value,
        _helpers: &dyn ConditionHelpers,
    ) -> Result<Value, ConditionError> {
        let operation = context["task"]["operation"]
            .as_str()
            .ok_or_else(|| ConditionError::UnknownIdentifier("task.operation".into()))?;
        Ok(Value::Bool(expression.split(',').any(|allowed| allowed.trim() == operation)))
    }
}

#[tokio::test]
async fn test_custom_evaluator() {
    init_tracing();
    let tasker = Tasker::builder().evaluator(AllowList).build().unwrap();

    let allowed = tasker
        .add_task(AddTaskOptions::new("report", Value::Null).add_condition("report, export"))
        .await
        .unwrap();
    let denied = tasker
        .add_task(AddTaskOptions::new("delete", Value::Null).add_condition("report, export"))
        .await
        .unwrap();
    assert!(!allowed.is_skipped());
    assert!(denied.is_skipped());
}
