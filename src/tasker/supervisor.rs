//! Supervision of a single running task.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use tracing::{error, warn};

use super::abort::{default_abort_reason, serialize_error, AbortSignal};
use super::events::TaskerEvent;
use super::log_tap::TaskLogger;
use super::model::{Task, TaskStatus};
use super::runner::{Runner, RunningTask};
use super::tasker::TaskerInner;
use crate::store::ReturnDocument;

fn timeout_reason(limit: Duration) -> Value {
    json!({
        "name": "TimeoutError",
        "message": format!("Task timed out after {} ms", limit.as_millis()),
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Runner panicked".to_string()
    }
}

impl TaskerInner {
    /// Runs the task to completion and records exactly one outcome.
    pub(crate) async fn supervise(self: Arc<Self>, task: Task, runner: Arc<dyn Runner>, signal: AbortSignal) {
        let logger = TaskLogger::new(
            task.uuid.clone(),
            task.operation.clone(),
            Arc::clone(&self.logs),
            Arc::clone(&self.channels),
            self.events.clone(),
        );
        let running = RunningTask {
            uuid: task.uuid.clone(),
            id: task.id.clone(),
            operation: task.operation.clone(),
            data: task.data.clone(),
            priority: task.priority,
            logger: logger.clone(),
            abort: signal.clone(),
        };

        let execution = AssertUnwindSafe(runner.run(running)).catch_unwind();
        let outcome = match task.run_timeout {
            Some(limit) => {
                tokio::pin!(execution);
                tokio::select! {
                    outcome = &mut execution => outcome,
                    _ = tokio::time::sleep(limit) => {
                        warn!(task_uuid = %task.uuid, timeout_ms = limit.as_millis() as u64, "Run timeout reached, aborting task");
                        signal.abort(timeout_reason(limit));
                        execution.await
                    }
                }
            }
            None => execution.await,
        };
        logger.detach();

        let (status, field, value) = match outcome {
            Ok(Ok(result)) => (TaskStatus::Done, "result", result),
            Ok(Err(_)) | Err(_) if signal.is_aborted() => (
                TaskStatus::Aborted,
                "abortReason",
                signal.reason().cloned().unwrap_or_else(default_abort_reason),
            ),
            Ok(Err(e)) => (TaskStatus::Failed, "error", serialize_error(&e)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(task_uuid = %task.uuid, panic = %message, "Runner panicked");
                (TaskStatus::Failed, "error", json!({"name": "Panic", "message": message}))
            }
        };

        let ended = self.tasks.update_one(
            &json!({"uuid": task.uuid, "status": TaskStatus::Running}),
            &json!({"$set": {
                "status": status,
                "endedAt": Utc::now().timestamp_millis(),
                field: value,
            }}),
            ReturnDocument::After,
        );
        match ended {
            Ok(Some(doc)) => match Task::from_document(doc) {
                Ok(ended) => self.announce_end(ended),
                Err(e) => error!(task_uuid = %task.uuid, error = %e, "Stored outcome is unreadable"),
            },
            Ok(None) => warn!(task_uuid = %task.uuid, "Task left running state before its outcome was stored"),
            Err(e) => error!(task_uuid = %task.uuid, error = %e, "Failed to store task outcome"),
        }

        self.aborts.remove(&task.uuid);
        self.channels.end(&task.uuid);
        if self.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.events.emit(TaskerEvent::Idle);
        }
        self.trigger();
    }
}
