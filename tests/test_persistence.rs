//! Durable storage, crash recovery and archiving.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;
use serde_json::json;
use tasker::{
    runner_fn, AddTaskOptions, Collection, GetTaskOptions, SledBackend, StorageBackend, TaskStatus,
    Tasker, TaskerConfig, TaskerError,
};

use common::*;

fn sled_tasker(db: &sled::Db) -> Tasker {
    init_tracing();
    let tasks: Arc<dyn StorageBackend> = Arc::new(SledBackend::open(db, "tasks").unwrap());
    let logs: Arc<dyn StorageBackend> = Arc::new(SledBackend::open(db, "logs").unwrap());
    Tasker::builder().backends(tasks, logs).build().unwrap()
}

fn collection(db: &sled::Db, name: &str) -> Collection {
    Collection::open(name, Arc::new(SledBackend::open(db, name).unwrap())).unwrap()
}

#[tokio::test]
async fn test_tasks_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();

    let (done, pending) = {
        let tasker = sled_tasker(&db);
        tasker.assign_runner("sum", runner_fn(sum)).unwrap();
        tasker.start(None).await.unwrap();
        let done = queued(tasker.add_task(AddTaskOptions::new("sum", json!([3, 4]))).await.unwrap());
        tasker.wait_for_task_output_data(&done).await.unwrap();
        let pending = queued(tasker.add_task(AddTaskOptions::new("later", json!([1, 2]))).await.unwrap());
        tasker.stop().await.unwrap();
        (done, pending)
    };

    let tasker = sled_tasker(&db);
    let restored = tasker.get_task(&done, GetTaskOptions::with_logs(None)).unwrap();
    assert_eq!(restored.status, TaskStatus::Done);
    assert_eq!(restored.result, Some(json!(7)));
    assert_eq!(restored.logs.unwrap().len(), 1);
    assert_eq!(task(&tasker, &pending).status, TaskStatus::Queued);

    tasker.assign_runner("later", runner_fn(sum)).unwrap();
    tasker.start(None).await.unwrap();
    assert_eq!(tasker.wait_for_task_output_data(&pending).await.unwrap(), json!(3));
    tasker.stop().await.unwrap();
}

#[tokio::test]
async fn test_storage_path_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = TaskerConfig::builder()
        .storage_path(dir.path().join("db"))
        .build()
        .unwrap();

    let tasker = Tasker::new(config).unwrap();
    let uuid = queued(tasker.add_task(AddTaskOptions::new("sum", json!([1, 2]))).await.unwrap());
    assert_eq!(task(&tasker, &uuid).status, TaskStatus::Queued);
    assert!(dir.path().join("db").exists());
}

#[tokio::test]
async fn test_crash_recovery_aborts_stale_running_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let now = Utc::now().timestamp_millis();
    collection(&db, "tasks")
        .insert(json!({
            "uuid": "stale",
            "operation": "sum",
            "data": [1, 2],
            "priority": 0,
            "status": "running",
            "createdAt": now - 100,
            "startedAt": now - 50,
        }))
        .unwrap();

    let tasker = sled_tasker(&db);
    let mut events = tasker.subscribe();
    tasker.start(None).await.unwrap();

    let recovered = task(&tasker, "stale");
    assert_eq!(recovered.status, TaskStatus::Aborted);
    assert_eq!(
        recovered.abort_reason,
        Some(json!({"name": "AbortError", "message": "Tasker restarted while task was running"}))
    );
    assert_ended_consistently(&recovered);

    let first = events.try_recv().unwrap();
    assert_eq!(first.name(), "task.aborted");
    assert_eq!(first.task_uuid(), Some("stale"));

    let err = tasker.wait_for_task_output_data("stale").await.unwrap_err();
    assert!(matches!(err, TaskerError::TaskAborted { .. }));
    tasker.stop().await.unwrap();
}

#[tokio::test]
async fn test_archiver_removes_expired_tasks_and_logs() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let now = Utc::now().timestamp_millis();
    {
        let tasks = collection(&db, "tasks");
        let logs = collection(&db, "logs");
        for (uuid, archiving) in [("expired", Some(1000)), ("unbounded", None), ("fresh", Some(60_000))] {
            let mut doc = json!({
                "uuid": uuid,
                "operation": "sum",
                "status": "done",
                "result": 1,
                "createdAt": now - 3000,
                "startedAt": now - 2500,
                "endedAt": now - 2000,
            });
            if let Some(duration) = archiving {
                doc["archiving"] = json!({"duration": duration});
            }
            tasks.insert(doc).unwrap();
            logs.insert(json!({
                "taskUuid": uuid,
                "seq": 0,
                "level": "info",
                "timestamp": now - 2200,
                "message": "working",
            }))
            .unwrap();
        }
    }

    let tasker = sled_tasker(&db);
    // Archiving runs eagerly on start.
    tasker.start(None).await.unwrap();
    assert!(matches!(
        tasker.get_task("expired", GetTaskOptions::default()).unwrap_err(),
        TaskerError::TaskNotFound { .. }
    ));
    let unbounded = tasker.get_task("unbounded", GetTaskOptions::with_logs(None)).unwrap();
    assert_eq!(unbounded.logs.unwrap().len(), 1);
    assert_eq!(task(&tasker, "fresh").status, TaskStatus::Done);
    assert_eq!(tasker.clean_ended_tasks().unwrap(), 0);
    tasker.stop().await.unwrap();

    let logs = collection(&db, "logs");
    assert_eq!(logs.count(&json!({"taskUuid": "expired"})).unwrap(), 0);
    assert_eq!(logs.count(&json!({})).unwrap(), 2);
}

#[tokio::test]
async fn test_clean_ended_tasks_after_retention() {
    let tasker = memory_tasker();
    tasker.assign_runner("sum", runner_fn(sum)).unwrap();
    tasker.start(None).await.unwrap();

    let uuid = queued(
        tasker
            .add_task(AddTaskOptions::new("sum", json!([1, 1])).archive_after(Duration::from_millis(20)))
            .await
            .unwrap(),
    );
    let kept = queued(tasker.add_task(AddTaskOptions::new("sum", json!([2, 2]))).await.unwrap());
    tasker.wait_for_task_output_data(&uuid).await.unwrap();
    tasker.wait_for_task_output_data(&kept).await.unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(tasker.clean_ended_tasks().unwrap(), 1);
    assert!(tasker.get_task(&uuid, GetTaskOptions::default()).is_err());
    assert_eq!(
        tasker.find_tasks(&json!({}), Default::default()).unwrap().len(),
        1
    );
    tasker.stop().await.unwrap();
}
