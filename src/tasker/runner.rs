use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::info;

use super::abort::AbortSignal;
use super::log_tap::TaskLogger;
use crate::core::{Result, TaskerError};

/// What a runner receives for one execution.
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub uuid: String,
    pub id: Option<Value>,
    pub operation: String,
    pub data: Value,
    pub priority: i64,
    pub logger: TaskLogger,
    pub abort: AbortSignal,
}

/// Executes tasks of one operation.
///
/// Runners must watch `task.abort` and return an error once it fires;
/// aborting never preempts a runner.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    async fn run(&self, task: RunningTask) -> anyhow::Result<Value>;
}

/// Adapts an async closure into a [`Runner`].
pub struct FnRunner<F>(F);

/// Wrap an async closure as a runner.
pub fn runner_fn<F, Fut>(f: F) -> FnRunner<F>
where
    F: Fn(RunningTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnRunner(f)
}

#[async_trait]
impl<F, Fut> Runner for FnRunner<F>
where
    F: Fn(RunningTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, task: RunningTask) -> anyhow::Result<Value> {
        (self.0)(task).await
    }
}

/// Registry of runners keyed by operation name. Write-once per name.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: DashMap<String, Arc<dyn Runner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, operation: impl Into<String>, runner: Arc<dyn Runner>) -> Result<()> {
        match self.runners.entry(operation.into()) {
            Entry::Occupied(entry) => Err(TaskerError::DuplicateRunner {
                operation: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                info!(operation = %entry.key(), "Runner assigned");
                entry.insert(runner);
                Ok(())
            }
        }
    }

    pub fn get(&self, operation: &str) -> Option<Arc<dyn Runner>> {
        self.runners.get(operation).map(|r| Arc::clone(r.value()))
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.runners.contains_key(operation)
    }

    pub fn operations(&self) -> Vec<String> {
        self.runners.iter().map(|r| r.key().clone()).collect()
    }
}
