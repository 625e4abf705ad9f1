//! Task executors and stage functions.
//!
//! A [`TaskExec`] names a task type and carries its stages. Stage functions
//! are plain async closures over a [`Context`]; they signal outcomes by
//! returning errors built with the context's error constructors (or any
//! other error, which is treated as a plain failure).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;
use crate::domain::{BoxError, TaskError, TaskErrorKind};

/// Boxed future returned by a stage function.
pub type StageFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// A stage body. Wrap async closures with [`stage_fn`].
pub type StageFn = Arc<dyn Fn(Context) -> StageFuture + Send + Sync>;

/// Adapt an async closure into a [`StageFn`].
pub fn stage_fn<F, Fut, E>(f: F) -> StageFn
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Arc::new(move |ctx| {
        let fut = f(ctx);
        Box::pin(async move { fut.await.map_err(Into::into) })
    })
}

/// A named stage within an executor.
#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub run: StageFn,
}

/// Executor for one task type: an entry stage plus named resume stages.
///
/// The entry stage has the empty name and is what a freshly submitted task
/// (or a task re-entering for rollback) runs.
#[derive(Clone)]
pub struct TaskExec {
    name: String,
    stages: Vec<Stage>,
}

impl TaskExec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// The task type this executor handles.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the entry stage.
    pub fn entry(self, run: StageFn) -> Self {
        self.stage("", run)
    }

    /// Add a named stage, reachable via `Context::resume_to` or a persisted
    /// task's `stage` field.
    pub fn stage(mut self, name: impl Into<String>, run: StageFn) -> Self {
        self.stages.push(Stage {
            name: name.into(),
            run,
        });
        self
    }

    /// Look up a stage. The empty name falls back to the first registered
    /// stage, so executors built with `stage("start", ..)` only still have
    /// an entry point.
    pub(crate) fn find_stage(&self, name: &str) -> Option<&Stage> {
        if name.is_empty() {
            return self
                .stages
                .iter()
                .find(|s| s.name.is_empty())
                .or_else(|| self.stages.first());
        }
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Pair a forward body with a rollback body; dispatch on the task's revert
/// flag.
pub fn revertable(forward: StageFn, rollback: StageFn) -> StageFn {
    Arc::new(move |ctx: Context| {
        if ctx.is_rollback() {
            rollback(ctx)
        } else {
            forward(ctx)
        }
    })
}

/// A stage that cannot be rolled back: rollback attempts fail immediately,
/// leaving the task failed rather than silently un-reverted.
pub fn non_revertable(forward: StageFn) -> StageFn {
    Arc::new(move |ctx: Context| {
        if ctx.is_rollback() {
            Box::pin(async {
                Err(Box::new(TaskError::new(
                    TaskErrorKind::Fail,
                    "stage is not revertable",
                )) as BoxError)
            })
        } else {
            forward(ctx)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_stage_is_the_empty_name() {
        let exec = TaskExec::new("process-obj")
            .entry(stage_fn(|ctx: Context| async move { ctx.set_output(&"entry") }))
            .stage("process", stage_fn(|_ctx| async { Ok::<_, TaskError>(()) }));
        assert!(exec.find_stage("").is_some());
        assert_eq!(exec.find_stage("").unwrap().name, "");
        assert_eq!(exec.find_stage("process").unwrap().name, "process");
        assert!(exec.find_stage("missing").is_none());
    }

    #[test]
    fn first_stage_serves_as_entry_when_none_is_unnamed() {
        let exec = TaskExec::new("process-obj")
            .stage("start", stage_fn(|_ctx| async { Ok::<_, TaskError>(()) }));
        assert_eq!(exec.find_stage("").unwrap().name, "start");
    }
}
