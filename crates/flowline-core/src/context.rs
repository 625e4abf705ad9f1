//! Stage execution context.
//!
//! The context is the entire capability surface handed to stage code:
//! payload access, sub-task submission, stage chaining and the error
//! constructors that drive the lifecycle. Mutations are buffered and only
//! committed by the worker after the stage returns, so a stage that fails
//! midway leaves no partial writes behind.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::domain::{Task, TaskBuilder, TaskError, TaskErrorKind};
use crate::error::EngineError;
use crate::strategy::Strategy;

/// Mutations buffered during one stage run.
#[derive(Default)]
pub(crate) struct StageBuffers {
    pub(crate) data: Option<Value>,
    pub(crate) output: Option<Value>,
    pub(crate) resume_to: Option<String>,
    pub(crate) sub_tasks: Vec<Task>,
}

struct ContextInner {
    task: Task,
    strategy: Arc<dyn Strategy>,
    buffers: Mutex<StageBuffers>,
}

/// Capability surface passed to a running stage. Cheap to clone.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn new(task: Task, strategy: Arc<dyn Strategy>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                task,
                strategy,
                buffers: Mutex::new(StageBuffers::default()),
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.inner.task.job_id
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task.id
    }

    /// True when this run executes in the rollback direction.
    pub fn is_rollback(&self) -> bool {
        self.inner.task.revert
    }

    /// Whether cancellation has been requested for the enclosing job.
    /// Advisory: it is up to the stage to act on it.
    pub async fn is_canceling(&self) -> Result<bool, EngineError> {
        self.inner
            .strategy
            .is_job_canceling(&self.inner.task.job_id)
            .await
    }

    /// Decode the task's submission parameters.
    pub fn get_params<T: DeserializeOwned>(&self) -> Result<Option<T>, TaskError> {
        self.inner.task.get_params()
    }

    /// Decode the stage-scratch payload persisted by earlier runs.
    pub fn get_data<T: DeserializeOwned>(&self) -> Result<Option<T>, TaskError> {
        self.inner.task.get_data()
    }

    /// Stage scratch data, persisted with the task if the stage succeeds or
    /// retries later.
    pub fn set_data<T: Serialize>(&self, data: &T) -> Result<(), TaskError> {
        let value = serde_json::to_value(data)?;
        self.buffers().data = Some(value);
        Ok(())
    }

    /// Final output of the task, visible to parents via `sub_tasks`.
    pub fn set_output<T: Serialize>(&self, output: &T) -> Result<(), TaskError> {
        let value = serde_json::to_value(output)?;
        self.buffers().output = Some(value);
        Ok(())
    }

    /// Park the task and resume at `stage` once all sub-tasks submitted in
    /// this run have finished. Without new sub-tasks the task requeues at
    /// `stage` immediately.
    pub fn resume_to(&self, stage: impl Into<String>) {
        self.buffers().resume_to = Some(stage.into());
    }

    /// Snapshots of all sub-tasks. Errors if any has not finished; call it
    /// from the resume stage, where completion is guaranteed.
    pub async fn sub_tasks(&self) -> Result<Vec<Task>, EngineError> {
        let mut tasks = Vec::with_capacity(self.inner.task.sub_task_ids.len());
        for id in &self.inner.task.sub_task_ids {
            let task = self
                .inner
                .strategy
                .query_task(id)
                .await?
                .ok_or_else(|| EngineError::TaskNotFound(id.clone()))?;
            if !task.state.is_terminal() {
                return Err(EngineError::SubTaskNotTerminal(id.clone()));
            }
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Start building a sub-task. Nothing is persisted until the stage
    /// returns successfully.
    pub fn new_task(&self, name: impl Into<String>) -> SubTaskBuilder<'_> {
        SubTaskBuilder {
            ctx: self,
            builder: TaskBuilder::new(name),
        }
    }

    /// Plain failure: triggers rollback (or final failure when already
    /// rolling back).
    pub fn fail(&self, msg: impl fmt::Display) -> TaskError {
        TaskError::new(TaskErrorKind::Fail, "failed").caused_by(msg)
    }

    /// Transient failure: requeue and retry while budget remains.
    pub fn fail_retry(&self, msg: impl fmt::Display) -> TaskError {
        TaskError::new(TaskErrorKind::Retry, "transient error").caused_by(msg)
    }

    /// Explicit rollback request, honored even with retry budget left.
    pub fn fail_rollback(&self, msg: impl fmt::Display) -> TaskError {
        TaskError::new(TaskErrorKind::Revert, "error, rolling back").caused_by(msg)
    }

    /// Park the task for operator intervention.
    pub fn stuck(&self, msg: impl fmt::Display) -> TaskError {
        TaskError::new(TaskErrorKind::Stuck, "stuck, needs intervention").caused_by(msg)
    }

    /// Swallow the error and complete the task as if the stage succeeded.
    pub fn ignore(&self, msg: impl fmt::Display) -> TaskError {
        TaskError::new(TaskErrorKind::Ignored, "ignored").caused_by(msg)
    }

    pub(crate) fn take_buffers(&self) -> StageBuffers {
        mem::take(&mut *self.buffers())
    }

    fn buffers(&self) -> std::sync::MutexGuard<'_, StageBuffers> {
        self.inner.buffers.lock().unwrap()
    }
}

/// Builder for a sub-task of the running stage's task.
pub struct SubTaskBuilder<'a> {
    ctx: &'a Context,
    builder: TaskBuilder,
}

impl SubTaskBuilder<'_> {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.builder = self.builder.id(id);
        self
    }

    pub fn params<T: Serialize>(mut self, params: &T) -> Result<Self, TaskError> {
        self.builder = self.builder.params(params)?;
        Ok(self)
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.builder = self.builder.max_retries(max_retries);
        self
    }

    /// Buffer the sub-task for submission; returns its id.
    pub fn submit(self) -> String {
        let task = self.builder.build();
        let id = task.id.clone();
        self.ctx.buffers().sub_tasks.push(task);
        id
    }
}
