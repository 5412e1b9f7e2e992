//! The `Tasker` facade and the state shared by its background units.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_broadcast::Receiver;
use chrono::Utc;
use dashmap::DashMap;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::abort::{default_abort_reason, stopped_reason, AbortSignal};
use super::config::TaskerConfig;
use super::events::{EventBus, TaskerEvent};
use super::log_tap::{LiveLogs, TaskChannels};
use super::model::{
    AddTaskOptions, AddTaskOutcome, FindTasksOptions, GetTaskOptions, LogEntry, LogLevel, Task,
    TaskStatus,
};
use super::runner::{Runner, RunnerRegistry};
use crate::condition::{
    evaluate_condition, ConditionError, ConditionEvaluator, ExpressionEvaluator, TaskQueryHelpers,
};
use crate::core::{Result, TaskerError};
use crate::store::{
    Collection, FindOptions, MemoryBackend, ReturnDocument, SledBackend, SortSpec, StorageBackend,
};

/// Options for [`Tasker::listen_task_logs`].
#[derive(Debug, Clone, Default)]
pub struct ListenLogsOptions {
    /// Replay persisted entries before following live ones.
    pub from_beginning: bool,
    /// Ends the stream early when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl ListenLogsOptions {
    pub fn from_beginning() -> Self {
        Self {
            from_beginning: true,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

pub(crate) struct TaskerInner {
    pub(crate) config: TaskerConfig,
    pub(crate) tasks: Arc<Collection>,
    pub(crate) logs: Arc<Collection>,
    pub(crate) runners: RunnerRegistry,
    pub(crate) evaluator: Arc<dyn ConditionEvaluator>,
    pub(crate) events: EventBus,
    pub(crate) channels: Arc<TaskChannels>,
    /// Abort signals of the tasks supervised by this process
    pub(crate) aborts: DashMap<String, AbortSignal>,
    pub(crate) admission: tokio::sync::Mutex<()>,
    pub(crate) wake: Notify,
    pub(crate) running: AtomicUsize,
    pub(crate) queue_empty: AtomicBool,
    pub(crate) supervisors: TaskTracker,
    /// Shutdown token of the current run; `None` while stopped.
    lifecycle: Mutex<Option<CancellationToken>>,
    _db: Option<sled::Db>,
}

impl TaskerInner {
    /// Requests a sweep. Requests made while one is in flight coalesce
    /// into a single follow-up sweep.
    pub(crate) fn trigger(&self) {
        self.wake.notify_one();
    }

    fn lifecycle(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn check_condition(&self, expression: &str, context: &Value) -> Result<bool, ConditionError> {
        let helpers = TaskQueryHelpers::new(&self.tasks);
        evaluate_condition(self.evaluator.as_ref(), expression, context, &helpers)
    }

    /// Emits the status-specific event followed by `task.ended`.
    pub(crate) fn announce_end(&self, task: Task) {
        let event = match task.status {
            TaskStatus::Done => TaskerEvent::TaskDone { task: task.clone() },
            TaskStatus::Failed => TaskerEvent::TaskFailed { task: task.clone() },
            TaskStatus::Aborted => TaskerEvent::TaskAborted { task: task.clone() },
            _ => return,
        };
        info!(task_uuid = %task.uuid, operation = %task.operation, status = %task.status, "Task ended");
        self.events.emit(event);
        self.events.emit(TaskerEvent::TaskEnded { task });
    }

    /// Aborts `uuid` if it is still queued. Returns false otherwise.
    pub(crate) fn abort_queued(&self, uuid: &str, reason: Value) -> Result<bool> {
        let aborted = self.tasks.update_one(
            &json!({"uuid": uuid, "status": TaskStatus::Queued}),
            &json!({"$set": {
                "status": TaskStatus::Aborted,
                "endedAt": Utc::now().timestamp_millis(),
                "abortReason": reason,
            }}),
            ReturnDocument::After,
        )?;
        let Some(doc) = aborted else {
            return Ok(false);
        };
        self.announce_end(Task::from_document(doc)?);
        self.channels.end(uuid);
        self.trigger();
        Ok(true)
    }

    /// Marks tasks left `running` by a previous process as aborted.
    pub(crate) fn recover_interrupted(&self) -> Result<usize> {
        let stale = self
            .tasks
            .find(&json!({"status": TaskStatus::Running}), &FindOptions::default())?;
        let reason = json!({
            "name": "AbortError",
            "message": "Tasker restarted while task was running",
        });

        let mut recovered = 0;
        for doc in stale {
            let task = Task::from_document(doc)?;
            if self.aborts.contains_key(&task.uuid) {
                continue;
            }
            let aborted = self.tasks.update_one(
                &json!({"uuid": task.uuid, "status": TaskStatus::Running}),
                &json!({"$set": {
                    "status": TaskStatus::Aborted,
                    "endedAt": Utc::now().timestamp_millis(),
                    "abortReason": reason,
                }}),
                ReturnDocument::After,
            )?;
            if let Some(doc) = aborted {
                warn!(task_uuid = %task.uuid, operation = %task.operation, "Interrupted task marked aborted");
                self.announce_end(Task::from_document(doc)?);
                self.channels.end(&task.uuid);
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "Crash recovery finished");
        }
        Ok(recovered)
    }

    /// Persisted logs of a task in emission order.
    pub(crate) fn load_logs(&self, uuid: &str, max_level: Option<LogLevel>) -> Result<Vec<LogEntry>> {
        let docs = self.logs.find(
            &json!({"taskUuid": uuid}),
            &FindOptions::sorted(SortSpec::new().asc("seq")),
        )?;
        let mut entries = Vec::with_capacity(docs.len());
        for doc in docs {
            let entry: LogEntry = serde_json::from_value(doc)?;
            if max_level.map_or(true, |max| entry.level <= max) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn attach_logs(&self, task: &mut Task, max_level: Option<LogLevel>) -> Result<()> {
        task.logs = Some(self.load_logs(&task.uuid, max_level)?);
        Ok(())
    }
}

/// Builder for [`Tasker`].
#[derive(Default)]
pub struct TaskerBuilder {
    config: TaskerConfig,
    evaluator: Option<Arc<dyn ConditionEvaluator>>,
    backends: Option<(Arc<dyn StorageBackend>, Arc<dyn StorageBackend>)>,
}

impl TaskerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: TaskerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default expression evaluator.
    pub fn evaluator(mut self, evaluator: impl ConditionEvaluator + 'static) -> Self {
        self.evaluator = Some(Arc::new(evaluator));
        self
    }

    /// Explicit backends for the `tasks` and `logs` collections. Takes
    /// precedence over `storage_path`.
    pub fn backends(mut self, tasks: Arc<dyn StorageBackend>, logs: Arc<dyn StorageBackend>) -> Self {
        self.backends = Some((tasks, logs));
        self
    }

    pub fn build(self) -> Result<Tasker> {
        self.config.validate()?;

        let (db, tasks_backend, logs_backend): (
            Option<sled::Db>,
            Arc<dyn StorageBackend>,
            Arc<dyn StorageBackend>,
        ) = match (self.backends, &self.config.storage_path) {
            (Some((tasks, logs)), _) => (None, tasks, logs),
            (None, Some(path)) => {
                let db = sled::open(path)?;
                let tasks = Arc::new(SledBackend::open(&db, "tasks")?);
                let logs = Arc::new(SledBackend::open(&db, "logs")?);
                (Some(db), tasks, logs)
            }
            (None, None) => (None, Arc::new(MemoryBackend::default()), Arc::new(MemoryBackend::default())),
        };

        let tasks = Arc::new(Collection::open("tasks", tasks_backend)?);
        let logs = Arc::new(Collection::open("logs", logs_backend)?);
        let stored = tasks.count(&json!({}))?;
        info!(storage = ?self.config.storage_path, tasks = stored, "Tasker initialized");

        let events = EventBus::new(self.config.event_capacity);
        Ok(Tasker {
            inner: Arc::new(TaskerInner {
                config: self.config,
                tasks,
                logs,
                runners: RunnerRegistry::new(),
                evaluator: self.evaluator.unwrap_or_else(|| Arc::new(ExpressionEvaluator)),
                events,
                channels: Arc::new(TaskChannels::new()),
                aborts: DashMap::new(),
                admission: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                running: AtomicUsize::new(0),
                queue_empty: AtomicBool::new(true),
                supervisors: TaskTracker::new(),
                lifecycle: Mutex::new(None),
                _db: db,
            }),
        })
    }
}

/// Persistent task orchestrator.
///
/// Cloning is cheap; clones share the same engine.
#[derive(Clone)]
pub struct Tasker {
    inner: Arc<TaskerInner>,
}

impl Tasker {
    pub fn new(config: TaskerConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> TaskerBuilder {
        TaskerBuilder::new()
    }

    pub fn config(&self) -> &TaskerConfig {
        &self.inner.config
    }

    pub fn is_started(&self) -> bool {
        self.inner.lifecycle().is_some()
    }

    /// Registers the runner for `operation`. Each operation takes one runner.
    pub fn assign_runner(&self, operation: impl Into<String>, runner: impl Runner) -> Result<()> {
        self.inner.runners.register(operation, Arc::new(runner))?;
        self.inner.trigger();
        Ok(())
    }

    /// Recovers interrupted tasks, runs the archiver once and starts the
    /// scheduling loop. A cancelled `cancel` token stops the Tasker.
    pub async fn start(&self, cancel: Option<CancellationToken>) -> Result<()> {
        let shutdown = {
            let mut lifecycle = self.inner.lifecycle();
            if lifecycle.is_some() {
                return Err(TaskerError::AlreadyStarted);
            }
            let token = CancellationToken::new();
            *lifecycle = Some(token.clone());
            token
        };

        if let Err(e) = self.inner.recover_interrupted() {
            *self.inner.lifecycle() = None;
            return Err(e);
        }
        if let Err(e) = self.inner.clean_ended_tasks() {
            error!(error = %e, "Archiving failed");
        }

        self.inner.supervisors.reopen();
        tokio::spawn(Arc::clone(&self.inner).run_scheduler(shutdown.clone()));
        tokio::spawn(Arc::clone(&self.inner).run_archiver(shutdown.clone()));
        if let Some(cancel) = cancel {
            let tasker = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = tasker.stop().await {
                            error!(error = %e, "Failed to stop Tasker on cancellation");
                        }
                    }
                    _ = shutdown.cancelled() => {}
                }
            });
        }

        info!(runners = ?self.inner.runners.operations(), "Tasker started");
        self.inner.events.emit(TaskerEvent::Started);
        self.inner.trigger();
        Ok(())
    }

    /// Stops scheduling, aborts what must not outlive the Tasker and waits
    /// up to `stop_timeout` for running tasks to settle. No-op when stopped.
    pub async fn stop(&self) -> Result<()> {
        let current = self.inner.lifecycle().take();
        let Some(shutdown) = current else {
            debug!("Tasker already stopped");
            return Ok(());
        };
        shutdown.cancel();

        let reason = stopped_reason();
        let flagged = self.inner.tasks.find(
            &json!({"status": TaskStatus::Queued, "onTaskerStop.abortQueued": true}),
            &FindOptions::default(),
        )?;
        for doc in flagged {
            if let Some(uuid) = doc.get("uuid").and_then(Value::as_str) {
                self.inner.abort_queued(uuid, reason.clone())?;
            }
        }

        let running: Vec<AbortSignal> = self.inner.aborts.iter().map(|s| s.value().clone()).collect();
        for signal in &running {
            signal.abort(reason.clone());
        }

        self.inner.supervisors.close();
        let settled = tokio::time::timeout(self.inner.config.stop_timeout, self.inner.supervisors.wait()).await;
        if settled.is_err() {
            warn!(
                unsettled = self.inner.supervisors.len(),
                "Running tasks did not settle before the stop timeout"
            );
        }

        self.inner.tasks.flush()?;
        self.inner.logs.flush()?;
        info!(signalled = running.len(), "Tasker stopped");
        self.inner.events.emit(TaskerEvent::Stopped);
        Ok(())
    }

    /// Admits a task. Admissions are applied one at a time in call order.
    pub async fn add_task(&self, options: AddTaskOptions) -> Result<AddTaskOutcome> {
        let _admission = self.inner.admission.lock().await;
        let task = Task::queued(options);

        if let Some(condition) = &task.add_condition {
            let context = json!({"task": &task});
            match self.inner.check_condition(condition, &context) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(operation = %task.operation, condition = %condition, "Admission condition rejected task");
                    return Ok(AddTaskOutcome::Skipped);
                }
                Err(e) => {
                    warn!(
                        operation = %task.operation,
                        condition = %condition,
                        error = %e,
                        "Admission condition could not be evaluated, task skipped"
                    );
                    return Ok(AddTaskOutcome::Skipped);
                }
            }
        }
        if !self.inner.runners.contains(&task.operation) {
            warn!(operation = %task.operation, "No runner assigned yet, task waits in queue");
        }

        self.inner.tasks.insert(task.to_document()?)?;
        info!(task_uuid = %task.uuid, operation = %task.operation, priority = task.priority, "Task queued");
        let uuid = task.uuid.clone();
        self.inner.events.emit(TaskerEvent::TaskAdded { task });
        self.inner.trigger();
        Ok(AddTaskOutcome::Queued { uuid })
    }

    /// Aborts a queued task immediately or signals a running one. Ended
    /// tasks are left untouched.
    pub fn abort_task(&self, uuid: &str, reason: Option<Value>) -> Result<()> {
        let reason = reason.unwrap_or_else(default_abort_reason);
        if self.inner.abort_queued(uuid, reason.clone())? {
            return Ok(());
        }

        let signal = self.inner.aborts.get(uuid).map(|s| s.value().clone());
        if let Some(signal) = signal {
            if signal.abort(reason) {
                info!(task_uuid = %uuid, "Abort requested");
            }
            return Ok(());
        }

        if self.inner.tasks.has(&json!({"uuid": uuid}))? {
            debug!(task_uuid = %uuid, "Abort ignored, task already ended");
            Ok(())
        } else {
            Err(TaskerError::not_found(uuid))
        }
    }

    pub fn prioritize_task(&self, uuid: &str, priority: i64) -> Result<()> {
        let updated = self.inner.tasks.update_one(
            &json!({"uuid": uuid, "status": TaskStatus::Queued}),
            &json!({"$set": {"priority": priority}}),
            ReturnDocument::After,
        )?;
        match updated {
            Some(doc) => {
                let task = Task::from_document(doc)?;
                info!(task_uuid = %uuid, priority, "Task reprioritized");
                self.inner.events.emit(TaskerEvent::TaskPrioritized { task });
                self.inner.trigger();
                Ok(())
            }
            None => match self.inner.tasks.find_one(&json!({"uuid": uuid}))? {
                Some(doc) => Err(TaskerError::NotQueued {
                    uuid: uuid.to_string(),
                    status: Task::from_document(doc)?.status,
                }),
                None => Err(TaskerError::not_found(uuid)),
            },
        }
    }

    pub fn get_task(&self, uuid: &str, options: GetTaskOptions) -> Result<Task> {
        let doc = self
            .inner
            .tasks
            .find_one(&json!({"uuid": uuid}))?
            .ok_or_else(|| TaskerError::not_found(uuid))?;
        let mut task = Task::from_document(doc)?;
        if options.with_logs {
            self.inner.attach_logs(&mut task, options.logs_max_level)?;
        }
        Ok(task)
    }

    pub fn find_tasks(&self, query: &Value, options: FindTasksOptions) -> Result<Vec<Task>> {
        let find = FindOptions {
            sort: options.sort,
            skip: options.skip,
            limit: options.limit,
            projection: None,
        };
        let docs = self.inner.tasks.find(query, &find)?;
        let mut tasks = Vec::with_capacity(docs.len());
        for doc in docs {
            let mut task = Task::from_document(doc)?;
            if options.with_logs {
                self.inner.attach_logs(&mut task, options.logs_max_level)?;
            }
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Waits until the task ends and returns its result, or its stored
    /// error / abort reason as [`TaskerError::TaskFailed`] / [`TaskerError::TaskAborted`].
    pub async fn wait_for_task_output_data(&self, uuid: &str) -> Result<Value> {
        loop {
            let mut ended = self.inner.channels.watch_end(uuid);
            let task = match self.get_task(uuid, GetTaskOptions::default()) {
                Ok(task) => task,
                Err(e) => {
                    drop(ended);
                    self.inner.channels.release(uuid);
                    return Err(e);
                }
            };
            if task.status.is_terminal() {
                drop(ended);
                self.inner.channels.release(uuid);
                return task.into_output();
            }
            // A closed channel also means the task ended; re-read either way.
            let _ = ended.wait_for(|done| *done).await;
        }
    }

    /// Streams the task's log entries. Finite once the task has ended.
    pub fn listen_task_logs(
        &self,
        uuid: &str,
        options: ListenLogsOptions,
    ) -> Result<BoxStream<'static, LogEntry>> {
        // Subscribe before reading so nothing emitted during the replay read is lost.
        let live = LiveLogs::listen(&self.inner.channels, uuid);
        let snapshot = self.get_task(uuid, GetTaskOptions::default()).and_then(|task| {
            let replay = if options.from_beginning {
                self.inner.load_logs(uuid, None)?
            } else {
                Vec::new()
            };
            Ok((task, replay))
        });
        let (task, replay) = snapshot?;

        let live = if task.status.is_terminal() {
            drop(live);
            stream::empty().boxed()
        } else {
            let replayed: HashSet<u64> = replay.iter().map(|entry| entry.seq).collect();
            live.filter(move |entry| future::ready(!replayed.contains(&entry.seq)))
                .boxed()
        };

        let entries = stream::iter(replay).chain(live);
        Ok(match options.cancel {
            Some(cancel) => entries.take_until(cancel.cancelled_owned()).boxed(),
            None => entries.boxed(),
        })
    }

    /// Runs the archiver now. Returns how many tasks were removed.
    pub fn clean_ended_tasks(&self) -> Result<usize> {
        self.inner.clean_ended_tasks()
    }

    /// Every event emitted from now on.
    pub fn subscribe(&self) -> Receiver<TaskerEvent> {
        self.inner.events.subscribe()
    }

    /// Events of one task.
    pub fn subscribe_task(&self, uuid: impl Into<String>) -> BoxStream<'static, TaskerEvent> {
        self.inner.events.subscribe_task(uuid)
    }
}
