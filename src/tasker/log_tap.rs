//! Log tap: per-task loggers whose entries are persisted, streamed to live
//! listeners and published on the event bus.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, trace, warn};

use super::events::{EventBus, TaskerEvent};
use super::model::{LogEntry, LogLevel};
use crate::store::Collection;

struct Channel {
    ended: watch::Sender<bool>,
    listeners: Vec<mpsc::UnboundedSender<LogEntry>>,
}

impl Channel {
    fn new() -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            ended,
            listeners: Vec::new(),
        }
    }
}

/// Per-uuid "ended" signals and live log listeners.
///
/// Entries are created on demand by waiters and dropped when the task ends,
/// which closes every listener stream.
#[derive(Default)]
pub(crate) struct TaskChannels {
    channels: DashMap<String, Channel>,
}

impl TaskChannels {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn watch_end(&self, uuid: &str) -> watch::Receiver<bool> {
        self.channels
            .entry(uuid.to_string())
            .or_insert_with(Channel::new)
            .ended
            .subscribe()
    }

    pub(crate) fn listen_logs(&self, uuid: &str) -> mpsc::UnboundedReceiver<LogEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .entry(uuid.to_string())
            .or_insert_with(Channel::new)
            .listeners
            .push(tx);
        rx
    }

    pub(crate) fn publish(&self, entry: &LogEntry) {
        if let Some(mut channel) = self.channels.get_mut(&entry.task_uuid) {
            channel.listeners.retain(|tx| tx.send(entry.clone()).is_ok());
        }
    }

    /// Raises the ended signal and closes all listeners of `uuid`.
    pub(crate) fn end(&self, uuid: &str) {
        if let Some((_, channel)) = self.channels.remove(uuid) {
            channel.ended.send_replace(true);
        }
    }

    /// Drops the entry for `uuid` if nobody is waiting on it any more.
    pub(crate) fn release(&self, uuid: &str) {
        self.channels.remove_if(uuid, |_, channel| {
            channel.ended.receiver_count() == 0 && channel.listeners.iter().all(|tx| tx.is_closed())
        });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.channels.len()
    }
}

/// Live log entries of one task. Dropping the stream releases its channel
/// entry so abandoned listeners do not pin it until the task ends.
pub(crate) struct LiveLogs {
    entries: UnboundedReceiverStream<LogEntry>,
    channels: Arc<TaskChannels>,
    task_uuid: String,
}

impl LiveLogs {
    pub(crate) fn listen(channels: &Arc<TaskChannels>, uuid: &str) -> Self {
        Self {
            entries: UnboundedReceiverStream::new(channels.listen_logs(uuid)),
            channels: Arc::clone(channels),
            task_uuid: uuid.to_string(),
        }
    }
}

impl Stream for LiveLogs {
    type Item = LogEntry;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<LogEntry>> {
        self.entries.poll_next_unpin(cx)
    }
}

impl Drop for LiveLogs {
    fn drop(&mut self) {
        self.entries.close();
        self.channels.release(&self.task_uuid);
    }
}

struct LoggerCore {
    task_uuid: String,
    operation: String,
    logs: Arc<Collection>,
    channels: Arc<TaskChannels>,
    events: EventBus,
    seq: AtomicU64,
    detached: AtomicBool,
}

/// Logger handed to runners.
///
/// Every entry goes to `tracing`. While the task runs, entries are also
/// stored in the `logs` collection and streamed to listeners. After the
/// task ends the logger is detached and only `tracing` receives entries.
#[derive(Clone)]
pub struct TaskLogger {
    core: Arc<LoggerCore>,
    fields: Map<String, Value>,
}

impl fmt::Debug for TaskLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLogger")
            .field("task_uuid", &self.core.task_uuid)
            .field("fields", &self.fields)
            .finish()
    }
}

impl TaskLogger {
    pub(crate) fn new(
        task_uuid: String,
        operation: String,
        logs: Arc<Collection>,
        channels: Arc<TaskChannels>,
        events: EventBus,
    ) -> Self {
        Self {
            core: Arc::new(LoggerCore {
                task_uuid,
                operation,
                logs,
                channels,
                events,
                seq: AtomicU64::new(0),
                detached: AtomicBool::new(false),
            }),
            fields: Map::new(),
        }
    }

    /// Child logger that adds `fields` to every entry.
    pub fn with_fields(&self, fields: Value) -> Self {
        let mut merged = self.fields.clone();
        if let Value::Object(extra) = fields {
            merged.extend(extra);
        }
        Self {
            core: Arc::clone(&self.core),
            fields: merged,
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, Value::Null);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, Value::Null);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, Value::Null);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message, Value::Null);
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.log(LogLevel::Trace, message, Value::Null);
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, fields: Value) {
        let message = message.into();
        let mut all = self.fields.clone();
        if let Value::Object(extra) = fields {
            all.extend(extra);
        }
        self.emit_tracing(level, &message, &all);

        if self.core.detached.load(Ordering::Acquire) {
            return;
        }

        let entry = LogEntry {
            task_uuid: self.core.task_uuid.clone(),
            seq: self.core.seq.fetch_add(1, Ordering::AcqRel),
            level,
            timestamp: Utc::now(),
            message,
            fields: all,
        };
        match serde_json::to_value(&entry) {
            Ok(doc) => {
                if let Err(e) = self.core.logs.insert(doc) {
                    error!(task_uuid = %entry.task_uuid, error = %e, "Failed to persist task log");
                }
            }
            Err(e) => error!(task_uuid = %entry.task_uuid, error = %e, "Failed to encode task log"),
        }
        self.core.channels.publish(&entry);
        self.core.events.emit(TaskerEvent::TaskLog { entry });
    }

    fn emit_tracing(&self, level: LogLevel, message: &str, fields: &Map<String, Value>) {
        let uuid = &self.core.task_uuid;
        let operation = &self.core.operation;
        let fields = Value::Object(fields.clone());
        match level {
            LogLevel::Error => error!(task_uuid = %uuid, operation = %operation, fields = %fields, "{}", message),
            LogLevel::Warn => warn!(task_uuid = %uuid, operation = %operation, fields = %fields, "{}", message),
            LogLevel::Info => info!(task_uuid = %uuid, operation = %operation, fields = %fields, "{}", message),
            LogLevel::Debug => debug!(task_uuid = %uuid, operation = %operation, fields = %fields, "{}", message),
            LogLevel::Trace => trace!(task_uuid = %uuid, operation = %operation, fields = %fields, "{}", message),
        }
    }

    /// Stops persisting and streaming. Later entries only reach `tracing`.
    pub(crate) fn detach(&self) {
        self.core.detached.store(true, Ordering::Release);
    }
}
