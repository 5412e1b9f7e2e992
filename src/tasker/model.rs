use std::fmt;
use std::time::Duration;

use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::{Result, TaskerError};
use crate::store::SortSpec;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
    Aborted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }

    pub const TERMINAL: [TaskStatus; 3] = [Self::Done, Self::Failed, Self::Aborted];
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durations stored as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}

/// Keeps an explicit `null` as `Some(Value::Null)`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// Retention window after a task ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archiving {
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

/// Behaviour of a queued task when the Tasker stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnTaskerStop {
    #[serde(default)]
    pub abort_queued: bool,
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub operation: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub priority: i64,
    pub status: TaskStatus,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "ts_milliseconds_option", skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<Value>,
    #[serde(default, with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub run_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archiving: Option<Archiving>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_tasker_stop: Option<OnTaskerStop>,
    /// Only populated by reads that ask for logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<LogEntry>>,
}

impl Task {
    /// Builds a fresh queued task from caller options.
    pub fn queued(options: AddTaskOptions) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            id: options.id,
            operation: options.operation,
            data: options.data,
            priority: options.priority,
            status: TaskStatus::Queued,
            // Stored documents keep milliseconds only.
            created_at: Utc::now().trunc_subsecs(3),
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            abort_reason: None,
            run_timeout: options.run_timeout,
            add_condition: options.add_condition,
            run_condition: options.run_condition,
            archiving: options.archiving,
            on_tasker_stop: options.on_tasker_stop,
            logs: None,
        }
    }

    pub fn from_document(doc: Value) -> Result<Self> {
        Ok(serde_json::from_value(doc)?)
    }

    pub fn to_document(&self) -> Result<Value> {
        let mut doc = serde_json::to_value(self)?;
        if let Some(map) = doc.as_object_mut() {
            map.remove("logs");
        }
        Ok(doc)
    }

    /// The stored outcome: the result when done, the error or abort reason otherwise.
    pub fn into_output(self) -> Result<Value> {
        match self.status {
            TaskStatus::Done => Ok(self.result.unwrap_or(Value::Null)),
            TaskStatus::Failed => Err(TaskerError::TaskFailed {
                uuid: self.uuid,
                error: self.error.unwrap_or(Value::Null),
            }),
            TaskStatus::Aborted => Err(TaskerError::TaskAborted {
                uuid: self.uuid,
                reason: self.abort_reason.unwrap_or(Value::Null),
            }),
            status => Err(TaskerError::NotEnded {
                uuid: self.uuid,
                status,
            }),
        }
    }
}

/// Parameters accepted by `Tasker::add_task`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddTaskOptions {
    #[serde(default)]
    pub id: Option<Value>,
    pub operation: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, with = "duration_ms::option")]
    pub run_timeout: Option<Duration>,
    #[serde(default)]
    pub add_condition: Option<String>,
    #[serde(default)]
    pub run_condition: Option<String>,
    #[serde(default)]
    pub archiving: Option<Archiving>,
    #[serde(default)]
    pub on_tasker_stop: Option<OnTaskerStop>,
}

impl AddTaskOptions {
    pub fn new(operation: impl Into<String>, data: Value) -> Self {
        Self {
            operation: operation.into(),
            data,
            ..Self::default()
        }
    }

    pub fn id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn add_condition(mut self, condition: impl Into<String>) -> Self {
        self.add_condition = Some(condition.into());
        self
    }

    pub fn run_condition(mut self, condition: impl Into<String>) -> Self {
        self.run_condition = Some(condition.into());
        self
    }

    pub fn archive_after(mut self, duration: Duration) -> Self {
        self.archiving = Some(Archiving { duration });
        self
    }

    pub fn abort_queued_on_stop(mut self, abort: bool) -> Self {
        self.on_tasker_stop = Some(OnTaskerStop { abort_queued: abort });
        self
    }
}

/// What `add_task` did with a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddTaskOutcome {
    Queued { uuid: String },
    /// The admission condition evaluated false; nothing was stored.
    Skipped,
}

impl AddTaskOutcome {
    pub fn uuid(&self) -> Option<&str> {
        match self {
            Self::Queued { uuid } => Some(uuid),
            Self::Skipped => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Log severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(name)
    }
}

/// One captured log line. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub task_uuid: String,
    /// Per-task emission order
    pub seq: u64,
    pub level: LogLevel,
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetTaskOptions {
    pub with_logs: bool,
    /// Least severe level included when `with_logs` is set
    pub logs_max_level: Option<LogLevel>,
}

impl GetTaskOptions {
    pub fn with_logs(max_level: Option<LogLevel>) -> Self {
        Self {
            with_logs: true,
            logs_max_level: max_level,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FindTasksOptions {
    pub sort: Option<SortSpec>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub with_logs: bool,
    pub logs_max_level: Option<LogLevel>,
}

impl FindTasksOptions {
    pub fn sorted(sort: SortSpec) -> Self {
        Self {
            sort: Some(sort),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_task_document_shape() {
        let task = Task::queued(
            AddTaskOptions::new("sum", json!([5, 4]))
                .id("job-1")
                .priority(2)
                .run_timeout(Duration::from_secs(3))
                .archive_after(Duration::from_millis(1500))
                .abort_queued_on_stop(true),
        );
        let doc = task.to_document().unwrap();

        assert_eq!(doc["status"], json!("queued"));
        assert_eq!(doc["operation"], json!("sum"));
        assert_eq!(doc["runTimeout"], json!(3000));
        assert_eq!(doc["archiving"], json!({"duration": 1500}));
        assert_eq!(doc["onTaskerStop"], json!({"abortQueued": true}));
        assert_eq!(doc["createdAt"], json!(task.created_at.timestamp_millis()));
        assert!(doc.get("startedAt").is_none());
        assert!(doc.get("result").is_none());

        let back = Task::from_document(doc).unwrap();
        assert_eq!(back.uuid, task.uuid);
        assert_eq!(back.run_timeout, Some(Duration::from_secs(3)));
        assert_eq!(back.created_at, task.created_at);
    }

    #[test]
    fn test_null_result_is_kept() {
        let task = Task::queued(AddTaskOptions::new("noop", Value::Null));
        let mut doc = task.to_document().unwrap();
        doc["status"] = json!("done");
        doc["result"] = Value::Null;
        doc["startedAt"] = json!(1);
        doc["endedAt"] = json!(2);

        let done = Task::from_document(doc).unwrap();
        assert_eq!(done.result, Some(Value::Null));
        assert_eq!(done.into_output().unwrap(), Value::Null);
    }

    #[test]
    fn test_output_of_failed_and_aborted() {
        let mut task = Task::queued(AddTaskOptions::new("op", Value::Null));
        task.status = TaskStatus::Failed;
        task.error = Some(json!({"message": "boom"}));
        assert!(matches!(
            task.clone().into_output(),
            Err(TaskerError::TaskFailed { error, .. }) if error["message"] == "boom"
        ));

        task.status = TaskStatus::Aborted;
        task.error = None;
        task.abort_reason = Some(json!("stop"));
        assert!(matches!(
            task.into_output(),
            Err(TaskerError::TaskAborted { reason, .. }) if reason == "stop"
        ));
    }

    #[test]
    fn test_log_levels_order_by_severity() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Info < LogLevel::Trace);
        assert_eq!(serde_json::to_value(LogLevel::Warn).unwrap(), json!("warn"));
    }
}
