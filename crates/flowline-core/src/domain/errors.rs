//! Classified task errors.
//!
//! A stage function reports problems as a [`TaskError`] carrying one of five
//! classifications; the classification alone decides the next lifecycle
//! transition. Errors are appended to the task document and never removed,
//! so the full failure history survives restarts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Boxed error type returned by stage functions.
///
/// Stage code can bubble up any error with `?`; everything that is not a
/// [`TaskError`] is normalized to the `Fail` classification by the worker.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of a stage failure. Drives the outcome commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Non-retriable failure; initiates rollback.
    Fail,
    /// Transient failure; re-attempt until the retry budget is exhausted.
    Retry,
    /// Explicit rollback request, regardless of current flags.
    Revert,
    /// Requires human intervention; the task is parked, never auto-retried.
    Stuck,
    /// Treat the reported problem as a benign completion.
    Ignored,
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskErrorKind::Fail => "fail",
            TaskErrorKind::Retry => "retry",
            TaskErrorKind::Revert => "revert",
            TaskErrorKind::Stuck => "stuck",
            TaskErrorKind::Ignored => "ignored",
        };
        f.write_str(s)
    }
}

/// An error raised by a stage function, persisted in the task's error history.
///
/// The `cause` is flattened to a string because the document outlives the
/// process that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the underlying cause.
    pub fn caused_by(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Coerce an arbitrary stage error into a classified one.
    ///
    /// A `TaskError` passes through unchanged; anything else becomes `Fail`.
    pub fn normalize(err: BoxError) -> Self {
        match err.downcast::<TaskError>() {
            Ok(task_err) => *task_err,
            Err(other) => {
                TaskError::new(TaskErrorKind::Fail, "unclassified error").caused_by(other)
            }
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::new(TaskErrorKind::Fail, "payload codec error").caused_by(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_classification() {
        let err: BoxError = TaskError::new(TaskErrorKind::Retry, "try again").into();
        let normalized = TaskError::normalize(err);
        assert_eq!(normalized.kind, TaskErrorKind::Retry);
        assert_eq!(normalized.message, "try again");
    }

    #[test]
    fn normalize_wraps_generic_errors_as_fail() {
        let err: BoxError = "connection refused".into();
        let normalized = TaskError::normalize(err);
        assert_eq!(normalized.kind, TaskErrorKind::Fail);
        assert_eq!(normalized.cause.as_deref(), Some("connection refused"));
    }

    #[test]
    fn serde_roundtrip() {
        let err = TaskError::new(TaskErrorKind::Stuck, "manual step needed").caused_by("disk full");
        let encoded = serde_json::to_string(&err).unwrap();
        let decoded: TaskError = serde_json::from_str(&encoded).unwrap();
        assert_eq!(err, decoded);
    }
}
