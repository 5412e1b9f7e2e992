//! Scheduling loop.
//!
//! A single actor owns the sweep. Everything else calls `trigger()`, which
//! stores at most one pending wake-up, so triggers arriving mid-sweep
//! collapse into exactly one follow-up sweep.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::abort::{stopped_reason, AbortSignal};
use super::events::TaskerEvent;
use super::model::{Task, TaskStatus};
use super::runner::Runner;
use super::tasker::TaskerInner;
use crate::core::Result;
use crate::store::{FindOptions, ReturnDocument, SortSpec};

impl TaskerInner {
    pub(crate) async fn run_scheduler(self: Arc<Self>, shutdown: CancellationToken) {
        debug!("Scheduling loop started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
            }
            if let Err(e) = self.sweep(&shutdown) {
                error!(error = %e, category = e.category(), "Scheduling sweep failed");
            }
        }
        debug!("Scheduling loop stopped");
    }

    /// One pass over the queued tasks, highest priority then oldest first.
    /// Nothing is promoted once `shutdown` is cancelled.
    pub(crate) fn sweep(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<()> {
        let queued = self.tasks.find(
            &json!({"status": TaskStatus::Queued}),
            &FindOptions::sorted(SortSpec::new().desc("priority").asc("createdAt")),
        )?;

        let mut rejected: Vec<String> = Vec::new();
        let mut started = 0usize;
        for doc in queued {
            let task = match Task::from_document(doc) {
                Ok(task) => task,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable queued task");
                    continue;
                }
            };
            let Some(runner) = self.runners.get(&task.operation) else {
                trace!(task_uuid = %task.uuid, operation = %task.operation, "No runner yet");
                continue;
            };
            if !self.may_run(&task, &rejected) {
                rejected.push(task.uuid);
                continue;
            }
            if shutdown.is_cancelled() {
                debug!(started, "Sweep interrupted by shutdown");
                return Ok(());
            }
            if self.promote(&task, runner, shutdown)? {
                started += 1;
            }
        }

        self.update_queue_state()?;
        debug!(started, rejected = rejected.len(), "Sweep finished");
        Ok(())
    }

    /// Evaluates the run condition. An evaluation error keeps the task
    /// queued and counts it as rejected for the rest of the sweep.
    fn may_run(&self, task: &Task, rejected: &[String]) -> bool {
        let Some(condition) = &task.run_condition else {
            return true;
        };
        let context = json!({
            "task": task,
            "beforeQueuedTasksUuids": rejected,
        });
        match self.check_condition(condition, &context) {
            Ok(eligible) => eligible,
            Err(e) => {
                warn!(
                    task_uuid = %task.uuid,
                    condition = %condition,
                    error = %e,
                    "Run condition could not be evaluated, task stays queued"
                );
                false
            }
        }
    }

    /// Moves a queued task to running and hands it to a supervisor.
    /// Returns false when the task left `queued` in the meantime.
    fn promote(
        self: &Arc<Self>,
        task: &Task,
        runner: Arc<dyn Runner>,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let signal = AbortSignal::new();
        self.aborts.insert(task.uuid.clone(), signal.clone());

        let started = self.tasks.update_one(
            &json!({"uuid": task.uuid, "status": TaskStatus::Queued}),
            &json!({"$set": {
                "status": TaskStatus::Running,
                "startedAt": Utc::now().timestamp_millis(),
            }}),
            ReturnDocument::After,
        );
        let task = match started.map_err(Into::into).and_then(|doc| doc.map(Task::from_document).transpose()) {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.aborts.remove(&task.uuid);
                return Ok(false);
            }
            Err(e) => {
                self.aborts.remove(&task.uuid);
                return Err(e);
            }
        };

        // stop() may have taken its snapshot of `aborts` before the insert above.
        if shutdown.is_cancelled() {
            signal.abort(stopped_reason());
        }

        if self.running.fetch_add(1, Ordering::AcqRel) == 0 {
            self.events.emit(TaskerEvent::Running);
        }
        info!(task_uuid = %task.uuid, operation = %task.operation, priority = task.priority, "Task started");
        self.events.emit(TaskerEvent::TaskRun { task: task.clone() });

        self.supervisors
            .spawn(Arc::clone(self).supervise(task, runner, signal));
        Ok(true)
    }

    /// Emits `queuing` / `empty-queue` when the queue changes between empty and non-empty.
    fn update_queue_state(&self) -> Result<()> {
        let empty = self.tasks.count(&json!({"status": TaskStatus::Queued}))? == 0;
        let was_empty = self.queue_empty.swap(empty, Ordering::AcqRel);
        match (was_empty, empty) {
            (true, false) => self.events.emit(TaskerEvent::Queuing),
            (false, true) => self.events.emit(TaskerEvent::EmptyQueue),
            _ => {}
        }
        Ok(())
    }
}
