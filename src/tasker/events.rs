//! Lifecycle events.
//!
//! Published on an `async-broadcast` channel with overflow enabled: slow
//! subscribers lose the oldest events rather than blocking the engine.

use async_broadcast::{InactiveReceiver, Receiver, Sender, TrySendError};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;

use super::model::{LogEntry, Task};

/// Event types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum TaskerEvent {
    #[serde(rename = "task.added")]
    TaskAdded { task: Task },
    #[serde(rename = "task.run")]
    TaskRun { task: Task },
    #[serde(rename = "task.log")]
    TaskLog { entry: LogEntry },
    #[serde(rename = "task.done")]
    TaskDone { task: Task },
    #[serde(rename = "task.failed")]
    TaskFailed { task: Task },
    #[serde(rename = "task.aborted")]
    TaskAborted { task: Task },
    #[serde(rename = "task.ended")]
    TaskEnded { task: Task },
    #[serde(rename = "task.prioritized")]
    TaskPrioritized { task: Task },
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "stopped")]
    Stopped,
    /// The queue went from empty to non-empty.
    #[serde(rename = "queuing")]
    Queuing,
    #[serde(rename = "empty-queue")]
    EmptyQueue,
    /// The first task started running.
    #[serde(rename = "running")]
    Running,
    /// The last running task ended.
    #[serde(rename = "idle")]
    Idle,
}

impl TaskerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskAdded { .. } => "task.added",
            Self::TaskRun { .. } => "task.run",
            Self::TaskLog { .. } => "task.log",
            Self::TaskDone { .. } => "task.done",
            Self::TaskFailed { .. } => "task.failed",
            Self::TaskAborted { .. } => "task.aborted",
            Self::TaskEnded { .. } => "task.ended",
            Self::TaskPrioritized { .. } => "task.prioritized",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Queuing => "queuing",
            Self::EmptyQueue => "empty-queue",
            Self::Running => "running",
            Self::Idle => "idle",
        }
    }

    /// The task this event is scoped to, if any.
    pub fn task_uuid(&self) -> Option<&str> {
        match self {
            Self::TaskAdded { task }
            | Self::TaskRun { task }
            | Self::TaskDone { task }
            | Self::TaskFailed { task }
            | Self::TaskAborted { task }
            | Self::TaskEnded { task }
            | Self::TaskPrioritized { task } => Some(&task.uuid),
            Self::TaskLog { entry } => Some(&entry.task_uuid),
            _ => None,
        }
    }
}

/// Process-wide event bus.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<TaskerEvent>,
    // Keeps the channel open while nobody is subscribed.
    _keepalive: InactiveReceiver<TaskerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(capacity.max(1));
        sender.set_overflow(true);
        sender.set_await_active(false);
        Self {
            sender,
            _keepalive: receiver.deactivate(),
        }
    }

    pub fn emit(&self, event: TaskerEvent) {
        tracing::debug!(event = event.name(), task_uuid = ?event.task_uuid(), "Event");
        match self.sender.try_broadcast(event) {
            Ok(_) | Err(TrySendError::Inactive(_)) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to publish event"),
        }
    }

    /// Every event emitted from now on.
    pub fn subscribe(&self) -> Receiver<TaskerEvent> {
        self.sender.new_receiver()
    }

    /// Events scoped to one task.
    pub fn subscribe_task(&self, uuid: impl Into<String>) -> BoxStream<'static, TaskerEvent> {
        let uuid = uuid.into();
        self.subscribe()
            .filter(move |event| futures::future::ready(event.task_uuid() == Some(uuid.as_str())))
            .boxed()
    }
}
