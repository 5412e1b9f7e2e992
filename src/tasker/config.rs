use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::model::duration_ms;
use crate::core::{Result, TaskerError};

/// Tasker configuration. Durations are written in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskerConfig {
    /// Directory of the sled database. Memory only when unset.
    pub storage_path: Option<PathBuf>,
    /// Period of the archiver sweep
    #[serde(with = "duration_ms")]
    pub archive_interval: Duration,
    /// Event bus capacity; the oldest events are dropped beyond it
    pub event_capacity: usize,
    /// How long `stop()` waits for running tasks to settle after aborting them
    #[serde(with = "duration_ms")]
    pub stop_timeout: Duration,
}

impl Default for TaskerConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            archive_interval: Duration::from_secs(60 * 60),
            event_capacity: 1024,
            stop_timeout: Duration::from_secs(30),
        }
    }
}

impl TaskerConfig {
    pub fn builder() -> TaskerConfigBuilder {
        TaskerConfigBuilder::new()
    }

    /// Loads a YAML file; missing keys take their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.archive_interval.is_zero() {
            return Err(TaskerError::InvalidConfiguration(
                "archive_interval must be greater than zero".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(TaskerError::InvalidConfiguration(
                "event_capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for TaskerConfig
pub struct TaskerConfigBuilder {
    config: TaskerConfig,
}

impl TaskerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TaskerConfig::default(),
        }
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_path = Some(path.into());
        self
    }

    pub fn archive_interval(mut self, interval: Duration) -> Self {
        self.config.archive_interval = interval;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TaskerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for TaskerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
