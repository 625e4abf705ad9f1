//! Scheduling strategy contract.
//!
//! A strategy turns the generic store primitives into scheduling semantics:
//! job/task persistence, a cancellation flag, and a claimable work queue.
//! The dispatcher and workers are ignorant of which implementation is bound.

mod simple;

pub use simple::SimpleStrategy;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{Job, Task};
use crate::error::EngineError;

/// Pluggable scheduling policy.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Persist a job and queue its root task as pending.
    async fn submit_job(&self, job: &Job) -> Result<(), EngineError>;

    /// Raise the job-level cancellation flag. Advisory: running stages are
    /// not preempted, they observe the flag cooperatively.
    async fn cancel_job(&self, id: &str) -> Result<(), EngineError>;

    async fn is_job_canceling(&self, id: &str) -> Result<bool, EngineError>;

    async fn query_job(&self, id: &str) -> Result<Option<Job>, EngineError>;

    async fn query_task(&self, id: &str) -> Result<Option<Task>, EngineError>;

    /// Per-worker view of this strategy.
    fn new_worker(&self, worker_id: &str) -> Box<dyn WorkerStrategy>;
}

/// Strategy instance scoped to one worker identity.
#[async_trait]
pub trait WorkerStrategy: Send + Sync {
    /// Claim one pending task. `Ok(None)` means nothing was claimable on
    /// this pass; the caller must poll again.
    async fn fetch_task(&self) -> Result<Option<Box<dyn TaskHandle>>, EngineError>;

    /// Claim one specific task by id, whatever its state. Used for the
    /// fan-in transition on a waiting parent. `Ok(None)` on contention or
    /// when the task does not exist.
    async fn acquire_task(&self, id: &str) -> Result<Option<Box<dyn TaskHandle>>, EngineError>;

    /// The lease TTL this strategy hands out. Callers retrying a contended
    /// acquisition must keep trying at least this long: a stale lease left
    /// by a crashed owner is only guaranteed to be reclaimable after it.
    fn lease_ttl(&self) -> Duration;
}

/// A claimed, lease-protected task.
///
/// The task is exclusively owned by this handle until `done`. Every mutation
/// refreshes the lease and re-reads the latest persisted snapshot first, so
/// a write can never clobber state committed by a newer owner.
#[async_trait]
pub trait TaskHandle: Send {
    /// Last-known snapshot.
    fn task(&self) -> &Task;

    /// Register a new sub-task under the lease. Parent and job ids are
    /// stamped from the lease-protected snapshot, not from the caller.
    async fn submit_task(&mut self, task: Task) -> Result<(), EngineError>;

    /// Commit a mutated snapshot under the lease.
    async fn update(&mut self, task: Task) -> Result<(), EngineError>;

    /// Release the lease. Idempotent.
    async fn done(&mut self) -> Result<(), EngineError>;
}
