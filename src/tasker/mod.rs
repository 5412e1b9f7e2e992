//! The task orchestration engine.

pub mod abort;
mod archiver;
pub mod config;
pub mod events;
pub mod log_tap;
pub mod model;
pub mod runner;
mod scheduler;
mod supervisor;
#[allow(clippy::module_inception)]
mod tasker;

pub use abort::{default_abort_reason, serialize_error, AbortError, AbortSignal, ThrownValue};
pub use config::{TaskerConfig, TaskerConfigBuilder};
pub use events::{EventBus, TaskerEvent};
pub use log_tap::TaskLogger;
pub use model::{
    AddTaskOptions, AddTaskOutcome, Archiving, FindTasksOptions, GetTaskOptions, LogEntry, LogLevel,
    OnTaskerStop, Task, TaskStatus,
};
pub use runner::{runner_fn, FnRunner, Runner, RunnerRegistry, RunningTask};
pub use tasker::{ListenLogsOptions, Tasker, TaskerBuilder};
