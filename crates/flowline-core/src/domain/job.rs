//! Job record and submission builder.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::error::EngineError;
use crate::strategy::Strategy;

use super::task::{Task, TaskState};

/// State of a job, derived from its root task. Never stored; recomputed on
/// every query so it can never drift from the task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Submitted, root task not claimed yet.
    Created,
    Running,
    /// The root task is parked and needs intervention.
    Stuck,
    Finished,
}

/// A user-submitted unit of work rooted at one task.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    /// The root task.
    pub task: Task,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Derive the job state from the root task's state.
    pub fn derive_state(root: &Task) -> JobState {
        match root.state {
            TaskState::Completed => JobState::Finished,
            TaskState::Stucked => JobState::Stuck,
            TaskState::Pending if root.stats.runs == 0 => JobState::Created,
            _ => JobState::Running,
        }
    }
}

/// Accumulates id, name and the root task, then submits through a strategy.
pub struct JobBuilder {
    strategy: Arc<dyn Strategy>,
    id: String,
    name: String,
    task: Option<Task>,
}

impl JobBuilder {
    pub(crate) fn new(strategy: Arc<dyn Strategy>) -> Self {
        Self {
            strategy,
            id: String::new(),
            name: String::new(),
            task: None,
        }
    }

    /// Override the generated job id. Must be globally unique.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The root task.
    pub fn task(mut self, task: Task) -> Self {
        self.task = Some(task);
        self
    }

    /// Assign ids, stamp the root task and hand the job to the strategy.
    pub async fn submit(self) -> Result<Job, EngineError> {
        let mut task = self.task.ok_or(EngineError::MissingRootTask)?;
        let id = if self.id.is_empty() {
            Ulid::new().to_string()
        } else {
            self.id
        };
        task.job_id = id.clone();
        let now = Utc::now();
        let job = Job {
            id,
            name: self.name,
            task,
            state: JobState::Created,
            created_at: now,
            updated_at: now,
        };
        self.strategy.submit_job(&job).await?;
        Ok(job)
    }
}
