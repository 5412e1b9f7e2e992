// Core infrastructure
pub mod core;

pub mod condition; // Admission and run conditions
pub mod store; // Document collections
pub mod tasker; // Engine and public API

// Re-exports for convenience
pub use crate::core::{Result, StoreError, TaskerError};
pub use crate::condition::{ConditionError, ConditionEvaluator, ConditionHelpers, ExpressionEvaluator};
pub use crate::store::{Collection, MemoryBackend, SledBackend, SortOrder, SortSpec, StorageBackend};
pub use crate::tasker::*;

pub use tasker_macros::runner;

#[doc(hidden)]
pub use async_trait::async_trait;
#[doc(hidden)]
pub use anyhow;
#[doc(hidden)]
pub use serde_json;
