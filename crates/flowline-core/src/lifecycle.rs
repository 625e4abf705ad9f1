//! Task lifecycle transitions.
//!
//! Pure functions from (task snapshot, buffered stage mutations, stage
//! outcome) to the state to commit. Keeping this free of I/O makes every
//! transition directly testable; the worker owns persistence.

use chrono::Utc;

use crate::context::StageBuffers;
use crate::domain::{Task, TaskError, TaskErrorKind, TaskResult, TaskState};

/// What the worker must persist after a stage run: the mutated task plus any
/// sub-tasks to submit under the same lease.
pub(crate) struct Commit {
    pub(crate) task: Task,
    pub(crate) new_tasks: Vec<Task>,
}

/// Compute the commit for one finished stage run.
///
/// On error all buffered mutations are discarded; a stage either commits
/// wholly or not at all.
pub(crate) fn apply_outcome(
    mut task: Task,
    buffers: StageBuffers,
    error: Option<TaskError>,
) -> Commit {
    let Some(error) = error else {
        return apply_success(task, buffers);
    };

    let kind = error.kind;
    task.errors.push(error);
    match kind {
        TaskErrorKind::Ignored => complete(task),
        TaskErrorKind::Stuck => {
            task.state = TaskState::Stucked;
            done(task)
        }
        TaskErrorKind::Retry => {
            if task.retries < task.max_retries {
                task.retries += 1;
                task.state = TaskState::Pending;
                done(task)
            } else {
                fail(task)
            }
        }
        TaskErrorKind::Fail => fail(task),
        TaskErrorKind::Revert => start_rollback(task),
    }
}

fn apply_success(mut task: Task, buffers: StageBuffers) -> Commit {
    if let Some(data) = buffers.data {
        task.data = data;
    }
    if let Some(output) = buffers.output {
        task.output = output;
    }
    for sub in &buffers.sub_tasks {
        if !task.sub_task_ids.iter().any(|id| id == &sub.id) {
            task.sub_task_ids.push(sub.id.clone());
        }
    }

    match buffers.resume_to {
        Some(stage) if buffers.sub_tasks.is_empty() => {
            // Nothing to wait for: chain straight into the next stage.
            task.stage = stage;
            task.resume_to = None;
            task.state = TaskState::Pending;
        }
        Some(stage) => {
            task.resume_to = Some(stage);
            task.state = TaskState::Waiting;
        }
        None => return complete_with(task, buffers.sub_tasks),
    }

    Commit {
        task,
        new_tasks: buffers.sub_tasks,
    }
}

/// A plain failure: roll back, unless we already are rolling back, in which
/// case the rollback itself failed and the task finishes as `Failed`.
fn fail(mut task: Task) -> Commit {
    if task.revert {
        task.state = TaskState::Completed;
        task.result = Some(TaskResult::Failed);
        task.stats.last_finished_at = Some(Utc::now());
        return done(task);
    }
    start_rollback(task)
}

/// Re-enter the executor from its entry stage in the rollback direction.
/// The revert flag is sticky; a fresh retry budget applies to the rollback.
fn start_rollback(mut task: Task) -> Commit {
    task.revert = true;
    task.stage.clear();
    task.resume_to = None;
    task.retries = 0;
    task.state = TaskState::Pending;
    done(task)
}

fn complete(task: Task) -> Commit {
    complete_with(task, Vec::new())
}

fn complete_with(mut task: Task, new_tasks: Vec<Task>) -> Commit {
    task.state = TaskState::Completed;
    task.result = Some(if task.revert {
        TaskResult::Aborted
    } else {
        TaskResult::Success
    });
    task.stats.last_finished_at = Some(Utc::now());
    Commit { task, new_tasks }
}

fn done(task: Task) -> Commit {
    Commit {
        task,
        new_tasks: Vec::new(),
    }
}
