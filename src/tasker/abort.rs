//! Cooperative abort.
//!
//! Runners receive an [`AbortSignal`] and are expected to watch it and
//! unwind. Nothing is forcibly cancelled: a runner that ignores the signal
//! runs to completion and its outcome is recorded as usual.

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Reason recorded when a task is aborted without an explicit one.
pub fn default_abort_reason() -> Value {
    json!({"name": "AbortError", "message": "This operation was aborted"})
}

/// Reason given to tasks that are aborted because the Tasker stopped.
pub(crate) fn stopped_reason() -> Value {
    json!({"name": "AbortError", "message": "Tasker stopped"})
}

/// Cancellation token plus the reason of the first abort request.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<Value>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests abort. Returns false if abort was already requested; the
    /// first reason wins.
    pub fn abort(&self, reason: Value) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<&Value> {
        self.reason.get()
    }

    /// Resolves once abort is requested.
    pub async fn aborted(&self) {
        self.token.cancelled().await
    }

    /// `Err(AbortError)` once abort is requested, for use with `?`.
    pub fn check(&self) -> Result<(), AbortError> {
        if self.is_aborted() {
            Err(AbortError {
                reason: self.reason().cloned().unwrap_or_else(default_abort_reason),
            })
        } else {
            Ok(())
        }
    }

    /// The underlying token, for handing to code that speaks tokio-util.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Raised by runners that unwind because of an abort request.
#[derive(Debug, Clone, PartialEq)]
pub struct AbortError {
    pub reason: Value,
}

impl fmt::Display for AbortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason.get("message").and_then(Value::as_str) {
            Some(message) => write!(f, "Aborted: {message}"),
            None => write!(f, "Aborted: {}", self.reason),
        }
    }
}

impl std::error::Error for AbortError {}

/// A runner failure that is persisted verbatim instead of being
/// serialized as an error object.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrownValue(pub Value);

impl fmt::Display for ThrownValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ThrownValue {}

/// Converts a runner error into its persisted form.
pub fn serialize_error(err: &anyhow::Error) -> Value {
    if let Some(ThrownValue(value)) = err.downcast_ref::<ThrownValue>() {
        return value.clone();
    }
    if let Some(abort) = err.downcast_ref::<AbortError>() {
        return json!({
            "name": "AbortError",
            "message": abort.to_string(),
            "reason": abort.reason,
        });
    }

    let mut doc = json!({
        "name": "Error",
        "message": err.to_string(),
    });
    let causes: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
    if !causes.is_empty() {
        doc["causes"] = json!(causes);
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let signal = AbortSignal::new();
        assert!(signal.check().is_ok());

        let observer = signal.clone();
        let waiter = tokio::spawn(async move { observer.aborted().await });

        assert!(signal.abort(json!("first")));
        assert!(!signal.abort(json!("second")));
        waiter.await.unwrap();

        assert!(signal.is_aborted());
        assert_eq!(signal.reason(), Some(&json!("first")));
        assert_eq!(signal.check().unwrap_err().reason, json!("first"));
    }

    #[test]
    fn test_serialize_error_shapes() {
        let plain = serialize_error(&anyhow!("boom"));
        assert_eq!(plain, json!({"name": "Error", "message": "boom"}));

        let chained = serialize_error(
            &Err::<(), _>(anyhow!("disk full"))
                .context("writing backup")
                .unwrap_err(),
        );
        assert_eq!(chained["message"], json!("writing backup"));
        assert_eq!(chained["causes"], json!(["disk full"]));

        let thrown = serialize_error(&anyhow::Error::new(ThrownValue(json!({"code": 3}))));
        assert_eq!(thrown, json!({"code": 3}));
    }
}
