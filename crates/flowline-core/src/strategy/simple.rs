//! Reference strategy: FIFO with leases.
//!
//! Jobs and tasks are persisted as JSON documents in two buckets, with task
//! counters in a third. Two ordered lists index the pending and waiting
//! tasks (presence toggled on every save, scored by last update), and one
//! more list carries job cancellation flags. `fetch_task` scans the pending
//! list oldest-first and claims the first candidate whose lock it wins;
//! losing candidates are left in place for whoever eventually succeeds,
//! including after lease expiry when the previous owner crashed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::{Job, Task, TaskError, TaskResult, TaskState, TaskStats};
use crate::error::EngineError;
use crate::store::{Acquisition, Store};

use super::{Strategy, TaskHandle, WorkerStrategy};

const JOBS_BUCKET: &str = "jobs";
const TASKS_BUCKET: &str = "tasks";
const TASK_STATS_BUCKET: &str = "task-stats";
const CANCEL_LIST: &str = "job-cancellation";
const PENDING_LIST: &str = "task-pending";
const WAITING_LIST: &str = "task-waiting";
const TASK_LOCK_PREFIX: &str = "task:";

const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);
const DEFAULT_PAGE_SIZE: usize = 10;

/// Persisted job document. Carries no state: job state is derived from the
/// root task on query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct JobDoc {
    id: String,
    name: String,
    task_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Persisted task document. Stats live in their own bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TaskDoc {
    id: String,
    parent_id: String,
    job_id: String,
    name: String,
    params: Value,
    state: TaskState,
    result: Option<TaskResult>,
    revert: bool,
    retries: u32,
    max_retries: u32,
    stage: String,
    resume_to: Option<String>,
    data: Value,
    output: Value,
    errors: Vec<TaskError>,
    subtask_ids: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TaskDoc {
    fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            parent_id: task.parent_id.clone(),
            job_id: task.job_id.clone(),
            name: task.name.clone(),
            params: task.params.clone(),
            state: task.state,
            result: task.result,
            revert: task.revert,
            retries: task.retries,
            max_retries: task.max_retries,
            stage: task.stage.clone(),
            resume_to: task.resume_to.clone(),
            data: task.data.clone(),
            output: task.output.clone(),
            errors: task.errors.clone(),
            subtask_ids: task.sub_task_ids.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }

    fn into_task(self, stats: TaskStats) -> Task {
        Task {
            id: self.id,
            parent_id: self.parent_id,
            job_id: self.job_id,
            name: self.name,
            params: self.params,
            state: self.state,
            result: self.result,
            revert: self.revert,
            retries: self.retries,
            max_retries: self.max_retries,
            stage: self.stage,
            resume_to: self.resume_to,
            data: self.data,
            output: self.output,
            errors: self.errors,
            sub_task_ids: self.subtask_ids,
            created_at: self.created_at,
            updated_at: self.updated_at,
            stats,
        }
    }
}

/// FIFO-with-leases [`Strategy`] over any [`Store`].
#[derive(Clone)]
pub struct SimpleStrategy {
    store: Arc<dyn Store>,
    lease_ttl: Duration,
    page_size: usize,
}

impl SimpleStrategy {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            lease_ttl: DEFAULT_LEASE_TTL,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Lease TTL used for task claims. Bounds how long a crashed worker can
    /// hold a task hostage.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Page size for pending-list scans.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Persist a task document and keep the pending/waiting indices in sync
    /// with its state. Claimed (`Running`) tasks stay in the pending index
    /// so they become reclaimable once a dead owner's lease expires.
    async fn save_task(
        &self,
        doc: &mut TaskDoc,
        stats: Option<&TaskStats>,
    ) -> Result<(), EngineError> {
        doc.updated_at = Utc::now();
        let encoded = serde_json::to_vec(doc)?;
        self.store
            .bucket(TASKS_BUCKET)
            .put(&doc.id, &encoded, None)
            .await?;
        self.store
            .ordered_list(PENDING_LIST)
            .set(
                &doc.id,
                matches!(doc.state, TaskState::Pending | TaskState::Running),
            )
            .await?;
        // The waiting index is not consumed by the engine itself; it is kept
        // for housekeeping and operator tooling to find parked parents.
        self.store
            .ordered_list(WAITING_LIST)
            .set(&doc.id, doc.state == TaskState::Waiting)
            .await?;
        if let Some(stats) = stats {
            let encoded = serde_json::to_vec(stats)?;
            self.store
                .bucket(TASK_STATS_BUCKET)
                .put(&doc.id, &encoded, None)
                .await?;
        }
        Ok(())
    }

    async fn load_task(&self, id: &str) -> Result<Option<Task>, EngineError> {
        let Some(raw) = self.store.bucket(TASKS_BUCKET).get(id).await? else {
            return Ok(None);
        };
        let doc: TaskDoc = serde_json::from_slice(&raw)?;
        let stats = match self.store.bucket(TASK_STATS_BUCKET).get(id).await? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => TaskStats::default(),
        };
        Ok(Some(doc.into_task(stats)))
    }
}

#[async_trait]
impl Strategy for SimpleStrategy {
    async fn submit_job(&self, job: &Job) -> Result<(), EngineError> {
        let doc = JobDoc {
            id: job.id.clone(),
            name: job.name.clone(),
            task_id: job.task.id.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        };
        let encoded = serde_json::to_vec(&doc)?;
        self.store
            .bucket(JOBS_BUCKET)
            .put(&doc.id, &encoded, None)
            .await?;

        let mut task_doc = TaskDoc::from_task(&job.task);
        task_doc.state = TaskState::Pending;
        self.save_task(&mut task_doc, Some(&job.task.stats)).await
    }

    async fn cancel_job(&self, id: &str) -> Result<(), EngineError> {
        self.store.ordered_list(CANCEL_LIST).set(id, true).await?;
        Ok(())
    }

    async fn is_job_canceling(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self.store.ordered_list(CANCEL_LIST).has(id).await?)
    }

    async fn query_job(&self, id: &str) -> Result<Option<Job>, EngineError> {
        let Some(raw) = self.store.bucket(JOBS_BUCKET).get(id).await? else {
            return Ok(None);
        };
        let doc: JobDoc = serde_json::from_slice(&raw)?;
        let task = self
            .load_task(&doc.task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(doc.task_id.clone()))?;
        Ok(Some(Job {
            id: doc.id,
            name: doc.name,
            state: Job::derive_state(&task),
            task,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }))
    }

    async fn query_task(&self, id: &str) -> Result<Option<Task>, EngineError> {
        self.load_task(id).await
    }

    fn new_worker(&self, worker_id: &str) -> Box<dyn WorkerStrategy> {
        Box::new(SimpleWorkerStrategy {
            worker_id: worker_id.to_string(),
            strategy: self.clone(),
        })
    }
}

/// Per-worker view of [`SimpleStrategy`].
struct SimpleWorkerStrategy {
    worker_id: String,
    strategy: SimpleStrategy,
}

impl SimpleWorkerStrategy {
    /// Acquire the task's lock; `None` when another owner holds it or the
    /// task does not exist.
    async fn try_acquire(&self, id: &str) -> Result<Option<SimpleTaskHandle>, EngineError> {
        let lock_name = format!("{TASK_LOCK_PREFIX}{id}");
        let acquisition = self
            .strategy
            .store
            .acquire(&lock_name, &self.worker_id, self.strategy.lease_ttl)
            .await?;
        if !acquisition.acquired() {
            return Ok(None);
        }
        let Some(task) = self.strategy.load_task(id).await? else {
            acquisition.release().await?;
            return Ok(None);
        };
        Ok(Some(SimpleTaskHandle {
            strategy: self.strategy.clone(),
            task_id: id.to_string(),
            cached: task,
            acquisition,
            released: false,
        }))
    }
}

#[async_trait]
impl WorkerStrategy for SimpleWorkerStrategy {
    async fn fetch_task(&self) -> Result<Option<Box<dyn TaskHandle>>, EngineError> {
        let pending = self.strategy.store.ordered_list(PENDING_LIST);
        let mut scan = pending.enumerate(self.strategy.page_size);
        while let Some(ids) = scan.next_page().await? {
            for id in ids {
                let Some(mut handle) = self.try_acquire(&id).await? else {
                    continue;
                };
                // Stale index entry, or claimed and completed since the scan
                // snapshot was taken. The owner's next save fixes the index.
                if !matches!(
                    handle.cached.state,
                    TaskState::Pending | TaskState::Running
                ) {
                    handle.done().await?;
                    continue;
                }
                let mut task = handle.cached.clone();
                task.state = TaskState::Running;
                task.stats.runs += 1;
                task.stats.last_claimed_at = Some(Utc::now());
                handle.update(task).await?;
                debug!(worker = %self.worker_id, task = %id, "claimed task");
                return Ok(Some(Box::new(handle)));
            }
        }
        Ok(None)
    }

    async fn acquire_task(&self, id: &str) -> Result<Option<Box<dyn TaskHandle>>, EngineError> {
        Ok(self
            .try_acquire(id)
            .await?
            .map(|handle| Box::new(handle) as Box<dyn TaskHandle>))
    }

    fn lease_ttl(&self) -> Duration {
        self.strategy.lease_ttl
    }
}

/// Lease-protected handle to one claimed task.
struct SimpleTaskHandle {
    strategy: SimpleStrategy,
    task_id: String,
    cached: Task,
    acquisition: Box<dyn Acquisition>,
    released: bool,
}

impl SimpleTaskHandle {
    /// Extend the lease and re-read the latest persisted snapshot. Every
    /// mutation goes through this first so a write never clobbers state
    /// committed by a newer owner after our lease expired.
    async fn refresh(&mut self) -> Result<(), EngineError> {
        let ttl = self.acquisition.ttl();
        self.acquisition
            .refresh(ttl)
            .await
            .map_err(|_| EngineError::LeaseLost(self.task_id.clone()))?;
        self.cached = self
            .strategy
            .load_task(&self.task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(self.task_id.clone()))?;
        Ok(())
    }
}

#[async_trait]
impl TaskHandle for SimpleTaskHandle {
    fn task(&self) -> &Task {
        &self.cached
    }

    async fn submit_task(&mut self, task: Task) -> Result<(), EngineError> {
        self.refresh().await?;

        let mut parent = TaskDoc::from_task(&self.cached);
        if !parent.subtask_ids.iter().any(|id| id == &task.id) {
            parent.subtask_ids.push(task.id.clone());
        }
        self.strategy.save_task(&mut parent, None).await?;

        // Parent and job ids come from the lease-protected snapshot; the
        // values on the submitted task are untrusted.
        let mut child = task;
        child.parent_id = self.cached.id.clone();
        child.job_id = self.cached.job_id.clone();
        child.state = TaskState::Pending;
        let mut doc = TaskDoc::from_task(&child);
        self.strategy.save_task(&mut doc, Some(&child.stats)).await?;

        self.refresh().await
    }

    async fn update(&mut self, task: Task) -> Result<(), EngineError> {
        self.refresh().await?;

        // Only stage-owned fields are taken from the caller's snapshot;
        // identity and submission-time fields stay as persisted.
        let mut doc = TaskDoc::from_task(&self.cached);
        doc.state = task.state;
        doc.result = task.result;
        doc.revert = task.revert;
        doc.retries = task.retries;
        doc.stage = task.stage;
        doc.resume_to = task.resume_to;
        doc.data = task.data;
        doc.output = task.output;
        doc.errors = task.errors;
        doc.subtask_ids = task.sub_task_ids;
        self.strategy.save_task(&mut doc, Some(&task.stats)).await?;

        self.refresh().await
    }

    async fn done(&mut self) -> Result<(), EngineError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.acquisition.release().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskBuilder, TaskErrorKind};
    use crate::store::MemoryStore;
    use serde_json::json;
    use tokio::time::sleep;

    fn strategy() -> SimpleStrategy {
        SimpleStrategy::new(Arc::new(MemoryStore::new()))
    }

    async fn submit_root(strategy: &SimpleStrategy, task: Task) -> Job {
        let job = Job {
            id: "job-1".to_string(),
            name: "test-job".to_string(),
            state: crate::domain::JobState::Created,
            task,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut job = job;
        job.task.job_id = job.id.clone();
        strategy.submit_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn task_document_roundtrip_preserves_every_field() {
        let strategy = strategy();
        let mut task = TaskBuilder::new("process-obj")
            .id("t-1")
            .params(&json!({"components": ["red", "blue"]}))
            .unwrap()
            .max_retries(3)
            .build();
        task.parent_id = "t-0".to_string();
        task.job_id = "job-1".to_string();
        task.state = TaskState::Waiting;
        task.result = Some(TaskResult::Success);
        task.revert = true;
        task.retries = 2;
        task.stage = "assemble".to_string();
        task.resume_to = Some("process".to_string());
        task.data = json!({"cursor": 7});
        task.output = json!(["red:done"]);
        task.errors
            .push(TaskError::new(TaskErrorKind::Retry, "transient").caused_by("io"));
        task.sub_task_ids = vec!["t-2".to_string(), "t-3".to_string()];
        task.stats.runs = 4;

        let mut doc = TaskDoc::from_task(&task);
        strategy.save_task(&mut doc, Some(&task.stats)).await.unwrap();

        let loaded = strategy.load_task("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.parent_id, task.parent_id);
        assert_eq!(loaded.job_id, task.job_id);
        assert_eq!(loaded.name, task.name);
        assert_eq!(loaded.state, task.state);
        assert_eq!(loaded.result, task.result);
        assert_eq!(loaded.revert, task.revert);
        assert_eq!(loaded.retries, task.retries);
        assert_eq!(loaded.max_retries, task.max_retries);
        assert_eq!(loaded.stage, task.stage);
        assert_eq!(loaded.resume_to, task.resume_to);
        assert_eq!(loaded.sub_task_ids, task.sub_task_ids);
        assert_eq!(loaded.params, task.params);
        assert_eq!(loaded.data, task.data);
        assert_eq!(loaded.output, task.output);
        assert_eq!(loaded.errors, task.errors);
        assert_eq!(loaded.stats, task.stats);
    }

    #[tokio::test]
    async fn submitted_root_task_is_fetchable() {
        let strategy = strategy();
        submit_root(&strategy, TaskBuilder::new("process-obj").id("t-1").build()).await;

        let worker = strategy.new_worker("worker-0");
        let handle = worker.fetch_task().await.unwrap().unwrap();
        assert_eq!(handle.task().id, "t-1");
        assert_eq!(handle.task().state, TaskState::Running);
        assert_eq!(handle.task().stats.runs, 1);
        assert_eq!(handle.task().job_id, "job-1");
    }

    #[tokio::test]
    async fn two_workers_racing_claim_exactly_one_wins() {
        let strategy = strategy();
        submit_root(&strategy, TaskBuilder::new("process-obj").id("t-1").build()).await;

        let w0 = strategy.new_worker("worker-0");
        let w1 = strategy.new_worker("worker-1");

        let first = w0.fetch_task().await.unwrap();
        let second = w1.fetch_task().await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none(), "the losing worker must get nothing");
    }

    #[tokio::test]
    async fn crashed_worker_lease_expires_and_task_is_reclaimed() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let strategy =
            SimpleStrategy::new(store).with_lease_ttl(Duration::from_millis(30));
        submit_root(&strategy, TaskBuilder::new("process-obj").id("t-1").build()).await;

        let w0 = strategy.new_worker("worker-0");
        let handle = w0.fetch_task().await.unwrap().unwrap();
        assert_eq!(handle.task().stats.runs, 1);
        // worker-0 "crashes": never calls done().
        drop(handle);

        sleep(Duration::from_millis(60)).await;

        let w1 = strategy.new_worker("worker-1");
        let reclaimed = w1.fetch_task().await.unwrap().unwrap();
        assert_eq!(reclaimed.task().id, "t-1");
        assert_eq!(reclaimed.task().stats.runs, 2);
    }

    #[tokio::test]
    async fn released_task_is_not_refetchable_once_completed() {
        let strategy = strategy();
        submit_root(&strategy, TaskBuilder::new("process-obj").id("t-1").build()).await;

        let worker = strategy.new_worker("worker-0");
        let mut handle = worker.fetch_task().await.unwrap().unwrap();
        let mut task = handle.task().clone();
        task.state = TaskState::Completed;
        task.result = Some(TaskResult::Success);
        handle.update(task).await.unwrap();
        handle.done().await.unwrap();

        assert!(worker.fetch_task().await.unwrap().is_none());
        let job = strategy.query_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.state, crate::domain::JobState::Finished);
    }

    #[tokio::test]
    async fn submit_task_stamps_lineage_from_the_snapshot() {
        let strategy = strategy();
        submit_root(&strategy, TaskBuilder::new("process-obj").id("t-1").build()).await;

        let worker = strategy.new_worker("worker-0");
        let mut handle = worker.fetch_task().await.unwrap().unwrap();

        let mut child = TaskBuilder::new("make-component").id("t-2").build();
        // Untrusted values supplied by stage code must be overwritten.
        child.parent_id = "forged".to_string();
        child.job_id = "forged".to_string();
        handle.submit_task(child).await.unwrap();

        assert_eq!(handle.task().sub_task_ids, vec!["t-2".to_string()]);
        let child = strategy.query_task("t-2").await.unwrap().unwrap();
        assert_eq!(child.parent_id, "t-1");
        assert_eq!(child.job_id, "job-1");
        assert_eq!(child.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn update_preserves_identity_fields() {
        let strategy = strategy();
        submit_root(&strategy, TaskBuilder::new("process-obj").id("t-1").build()).await;

        let worker = strategy.new_worker("worker-0");
        let mut handle = worker.fetch_task().await.unwrap().unwrap();

        let mut forged = handle.task().clone();
        forged.parent_id = "forged".to_string();
        forged.name = "forged".to_string();
        forged.stage = "process".to_string();
        handle.update(forged).await.unwrap();

        let task = strategy.query_task("t-1").await.unwrap().unwrap();
        assert_eq!(task.parent_id, "");
        assert_eq!(task.name, "process-obj");
        assert_eq!(task.stage, "process");
    }

    #[tokio::test]
    async fn cancellation_flag_is_set_and_observed() {
        let strategy = strategy();
        assert!(!strategy.is_job_canceling("job-1").await.unwrap());
        strategy.cancel_job("job-1").await.unwrap();
        assert!(strategy.is_job_canceling("job-1").await.unwrap());
    }

    #[tokio::test]
    async fn waiting_task_is_not_fetchable() {
        let strategy = strategy();
        submit_root(&strategy, TaskBuilder::new("process-obj").id("t-1").build()).await;

        let worker = strategy.new_worker("worker-0");
        let mut handle = worker.fetch_task().await.unwrap().unwrap();
        let mut task = handle.task().clone();
        task.state = TaskState::Waiting;
        task.resume_to = Some("process".to_string());
        handle.update(task).await.unwrap();
        handle.done().await.unwrap();

        assert!(worker.fetch_task().await.unwrap().is_none());

        // But a targeted acquisition for fan-in still works.
        let acquired = worker.acquire_task("t-1").await.unwrap().unwrap();
        assert_eq!(acquired.task().state, TaskState::Waiting);
    }
}
