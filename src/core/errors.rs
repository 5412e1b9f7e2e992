use serde_json::Value;
use thiserror::Error;

use crate::condition::ConditionError;
use crate::tasker::model::TaskStatus;

/// Errors raised by the document collections.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Invalid pipeline stage: {0}")]
    InvalidPipeline(String),

    #[error("Documents must be JSON objects")]
    NotADocument,
}

impl StoreError {
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        Self::InvalidQuery(msg.into())
    }

    pub fn invalid_update(msg: impl Into<String>) -> Self {
        Self::InvalidUpdate(msg.into())
    }

    pub fn invalid_pipeline(msg: impl Into<String>) -> Self {
        Self::InvalidPipeline(msg.into())
    }
}

/// Unified error type for the Tasker API
#[derive(Debug, Error)]
pub enum TaskerError {
    #[error("Task not found: {uuid}")]
    TaskNotFound { uuid: String },

    #[error("A runner is already assigned to operation {operation}")]
    DuplicateRunner { operation: String },

    #[error("Task {uuid} is not queued (status: {status})")]
    NotQueued { uuid: String, status: TaskStatus },

    #[error("Task {uuid} has not ended (status: {status})")]
    NotEnded { uuid: String, status: TaskStatus },

    #[error("Task {uuid} failed: {error}")]
    TaskFailed { uuid: String, error: Value },

    #[error("Task {uuid} aborted: {reason}")]
    TaskAborted { uuid: String, reason: Value },

    #[error("Tasker is already started")]
    AlreadyStarted,

    #[error("Configuration invalid: {0}")]
    InvalidConfiguration(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Condition error: {0}")]
    Condition(#[from] ConditionError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskerError {
    pub fn not_found(uuid: impl Into<String>) -> Self {
        Self::TaskNotFound { uuid: uuid.into() }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } | Self::NotQueued { .. } | Self::NotEnded { .. } => "task",
            Self::TaskFailed { .. } | Self::TaskAborted { .. } => "outcome",
            Self::DuplicateRunner { .. }
            | Self::AlreadyStarted
            | Self::InvalidConfiguration(_) => "configuration",
            Self::Store(_) => "database",
            Self::Condition(_) => "condition",
            Self::Json(_) | Self::Yaml(_) => "serialization",
            Self::Io(_) => "io",
        }
    }

    /// Whether this error carries the stored outcome of a finished task
    pub fn is_task_outcome(&self) -> bool {
        matches!(self, Self::TaskFailed { .. } | Self::TaskAborted { .. })
    }
}

impl From<sled::Error> for TaskerError {
    fn from(err: sled::Error) -> Self {
        Self::Store(StoreError::Database(err))
    }
}

/// Result type alias for convenience
pub type Result<T, E = TaskerError> = std::result::Result<T, E>;
