//! Task record and builder.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use super::errors::TaskError;

/// State of a task in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Queued and unclaimed; eligible for `fetch_task`.
    Pending,
    /// Blocked on outstanding sub-tasks; not claimable.
    Waiting,
    /// Claimed by exactly one worker (lease held).
    Running,
    /// Parked; requires external intervention, never auto-retried.
    Stucked,
    /// Terminal.
    Completed,
}

impl TaskState {
    /// Terminal means the task finished one way or another. `Stucked` is not
    /// terminal: it can still be requeued by an operator.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed)
    }
}

/// Result of a completed task. Only meaningful once state is `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    Success,
    Failed,
    /// The task was rolled back to completion.
    Aborted,
}

/// Execution counters, persisted separately from the task document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Times the task has been claimed and run (any stage, any direction).
    pub runs: u32,
    pub last_claimed_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

/// One unit of executable stage logic, possibly having sub-tasks.
///
/// `parent_id` and `job_id` are set exactly once at submission and never
/// change; `sub_task_ids` only grows, in submission order. Payload fields
/// (`params`, `data`, `output`) are opaque JSON values the engine never
/// interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub parent_id: String,
    pub job_id: String,
    /// Names the executor registered in the dispatcher.
    pub name: String,
    pub params: Value,
    pub state: TaskState,
    pub result: Option<TaskResult>,
    /// Sticky rollback flag; never cleared once rollback begins.
    pub revert: bool,
    pub retries: u32,
    pub max_retries: u32,
    /// Current stage name; empty selects the executor's entry stage.
    pub stage: String,
    /// Stage to resume at once all sub-tasks finish.
    pub resume_to: Option<String>,
    /// Stage-scratch payload, persisted across runs.
    pub data: Value,
    pub output: Value,
    /// Append-only failure history; the most recent entry drove the last
    /// transition.
    pub errors: Vec<TaskError>,
    pub sub_task_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: TaskStats,
}

impl Task {
    /// Decode `params`; `None` when no parameters were supplied.
    pub fn get_params<T: DeserializeOwned>(&self) -> Result<Option<T>, TaskError> {
        decode(&self.params)
    }

    /// Decode the persisted stage-scratch payload.
    pub fn get_data<T: DeserializeOwned>(&self) -> Result<Option<T>, TaskError> {
        decode(&self.data)
    }

    /// Decode the final output payload.
    pub fn get_output<T: DeserializeOwned>(&self) -> Result<Option<T>, TaskError> {
        decode(&self.output)
    }

    /// The error that drove the most recent transition, if any.
    pub fn last_error(&self) -> Option<&TaskError> {
        self.errors.last()
    }
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<Option<T>, TaskError> {
    if value.is_null() {
        return Ok(None);
    }
    serde_json::from_value(value.clone())
        .map(Some)
        .map_err(TaskError::from)
}

/// Builder for new tasks (root tasks and sub-tasks alike).
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    id: String,
    name: String,
    params: Value,
    max_retries: u32,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            params: Value::Null,
            max_retries: 0,
        }
    }

    /// Override the generated id. Must be globally unique.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach encoded parameters for the stage functions.
    pub fn params<T: Serialize>(mut self, params: &T) -> Result<Self, TaskError> {
        self.params = serde_json::to_value(params)?;
        Ok(self)
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn build(self) -> Task {
        let now = Utc::now();
        let id = if self.id.is_empty() {
            Ulid::new().to_string()
        } else {
            self.id
        };
        Task {
            id,
            parent_id: String::new(),
            job_id: String::new(),
            name: self.name,
            params: self.params,
            state: TaskState::Pending,
            result: None,
            revert: false,
            retries: 0,
            max_retries: self.max_retries,
            stage: String::new(),
            resume_to: None,
            data: Value::Null,
            output: Value::Null,
            errors: Vec::new(),
            sub_task_ids: Vec::new(),
            created_at: now,
            updated_at: now,
            stats: TaskStats::default(),
        }
    }
}
