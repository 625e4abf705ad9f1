//! Domain model: jobs, tasks, classified errors.

pub mod errors;
pub mod job;
pub mod task;

pub use errors::{BoxError, TaskError, TaskErrorKind};
pub use job::{Job, JobBuilder, JobState};
pub use task::{Task, TaskBuilder, TaskResult, TaskState, TaskStats};
