//! Admission and run conditions.
//!
//! A condition is an expression string evaluated against a context object.
//! The evaluation strategy is pluggable through [`ConditionEvaluator`];
//! [`ExpressionEvaluator`] is the default. Helpers that query the task
//! collection are handed in as a [`ConditionHelpers`] capability.

mod expr;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::core::StoreError;
use crate::store::Collection;

pub use expr::ExpressionEvaluator;

#[derive(Debug, Error)]
pub enum ConditionError {
    #[error("Syntax error at {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Helper query failed: {0}")]
    Helper(#[from] StoreError),
}

impl ConditionError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }
}

/// Functions exposed to condition expressions.
pub trait ConditionHelpers: Send + Sync {
    /// `hasTask(query)`
    fn has_task(&self, query: &Value) -> Result<bool, ConditionError>;

    /// `countTasks(query)`
    fn count_tasks(&self, query: &Value) -> Result<u64, ConditionError>;
}

/// Strategy that turns an expression into a value.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(
        &self,
        expression: &str,
        context: &Value,
        helpers: &dyn ConditionHelpers,
    ) -> Result<Value, ConditionError>;
}

/// Helpers backed by the task collection.
pub struct TaskQueryHelpers<'a> {
    tasks: &'a Collection,
}

impl<'a> TaskQueryHelpers<'a> {
    pub fn new(tasks: &'a Collection) -> Self {
        Self { tasks }
    }
}

impl ConditionHelpers for TaskQueryHelpers<'_> {
    fn has_task(&self, query: &Value) -> Result<bool, ConditionError> {
        Ok(self.tasks.has(query)?)
    }

    fn count_tasks(&self, query: &Value) -> Result<u64, ConditionError> {
        Ok(self.tasks.count(query)?)
    }
}

/// JavaScript-style truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Evaluates `expression` and casts the result to a boolean, warning when
/// the expression did not produce one.
pub fn evaluate_condition(
    evaluator: &dyn ConditionEvaluator,
    expression: &str,
    context: &Value,
    helpers: &dyn ConditionHelpers,
) -> Result<bool, ConditionError> {
    match evaluator.evaluate(expression, context, helpers)? {
        Value::Bool(b) => Ok(b),
        other => {
            let cast = truthy(&other);
            warn!(
                expression = %expression,
                value = %other,
                cast,
                "Condition did not return a boolean, casting"
            );
            Ok(cast)
        }
    }
}
