//! Worker loop and pool.
//!
//! A worker repeatedly claims one task, runs the stage its snapshot points
//! at, and commits the resulting transition under the claim's lease. The
//! loop is crash-oblivious: a worker that dies mid-task simply stops
//! refreshing the lease, and the task is reclaimed elsewhere once it
//! expires.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::context::{Context, StageBuffers};
use crate::dispatcher::Dispatcher;
use crate::domain::{TaskError, TaskErrorKind, TaskState};
use crate::error::EngineError;
use crate::lifecycle::{self, Commit};
use crate::strategy::{TaskHandle, WorkerStrategy};

/// Tunables for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Sleep between fetch attempts when the queue is empty. A random jitter
    /// of up to half this interval is added so idle workers desynchronize.
    pub poll_interval: Duration,
    /// Sleep between attempts to acquire a waiting parent during fan-in.
    /// The retry window itself is derived from the strategy's lease TTL.
    pub fan_in_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            fan_in_backoff: Duration::from_millis(50),
        }
    }
}

/// A single task-processing loop. Create via [`Dispatcher::worker`].
pub struct Worker {
    id: String,
    dispatcher: Arc<Dispatcher>,
    strategy_worker: Box<dyn WorkerStrategy>,
    options: WorkerOptions,
}

impl Worker {
    pub(crate) fn new(id: String, dispatcher: Arc<Dispatcher>, options: WorkerOptions) -> Self {
        let strategy_worker = dispatcher.strategy().new_worker(&id);
        Self {
            id,
            dispatcher,
            strategy_worker,
            options,
        }
    }

    /// Run until `shutdown` flips to true. The stage in flight when shutdown
    /// fires is abandoned; its lease expiry requeues it.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %self.id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender means nobody can ever signal us; stop
                    // instead of spinning on a closed channel.
                    if changed.is_err() {
                        break;
                    }
                }
                fetched = self.strategy_worker.fetch_task() => match fetched {
                    Ok(Some(handle)) => self.execute(handle).await,
                    Ok(None) => self.idle().await,
                    Err(err) => {
                        warn!(worker = %self.id, error = %err, "fetch failed");
                        self.idle().await;
                    }
                },
            }
        }
        debug!(worker = %self.id, "worker stopped");
    }

    async fn idle(&self) {
        let half = self.options.poll_interval.as_millis() as u64 / 2;
        let jitter = rand::thread_rng().gen_range(0..=half);
        sleep(self.options.poll_interval + Duration::from_millis(jitter)).await;
    }

    /// Run one claimed task through its current stage and commit the
    /// transition.
    async fn execute(&self, mut handle: Box<dyn TaskHandle>) {
        let task = handle.task().clone();
        let task_id = task.id.clone();
        let (buffers, error) = self.run_stage(task.clone()).await;
        let commit = lifecycle::apply_outcome(task, buffers, error);

        let committed = self.commit(handle.as_mut(), &commit).await;
        if let Err(err) = handle.done().await {
            warn!(worker = %self.id, task = %task_id, error = %err, "lease release failed");
        }
        if let Err(err) = committed {
            // Leave the task to its lease: whoever claims it next reruns the
            // stage from the last committed snapshot.
            warn!(worker = %self.id, task = %task_id, error = %err, "commit failed");
            return;
        }

        if commit.task.state.is_terminal() && !commit.task.parent_id.is_empty() {
            if let Err(err) = self.fan_in(&commit.task.parent_id).await {
                warn!(worker = %self.id, parent = %commit.task.parent_id, error = %err,
                      "fan-in failed");
            }
        }
    }

    async fn run_stage(&self, task: crate::domain::Task) -> (StageBuffers, Option<TaskError>) {
        let Some(stage) = self.dispatcher.find_stage(&task.name, &task.stage) else {
            let error = TaskError::new(
                TaskErrorKind::Fail,
                format!(
                    "no stage {:?} registered for task {:?}",
                    task.stage, task.name
                ),
            );
            return (StageBuffers::default(), Some(error));
        };
        let run = stage.run.clone();
        let ctx = Context::new(task, self.dispatcher.strategy());
        let error = run(ctx.clone()).await.err().map(TaskError::normalize);
        (ctx.take_buffers(), error)
    }

    /// Persist one transition under the task's lease: new sub-tasks first,
    /// then the parent snapshot that references them.
    async fn commit(
        &self,
        handle: &mut dyn TaskHandle,
        commit: &Commit,
    ) -> Result<(), EngineError> {
        for child in &commit.new_tasks {
            handle.submit_task(child.clone()).await?;
        }
        handle.update(commit.task.clone()).await
    }

    /// After a child reaches a terminal state, try to move its waiting
    /// parent back to pending. Siblings race for the parent's lease; any
    /// single winner observing all children terminal performs the
    /// transition, everyone else finds nothing left to do.
    async fn fan_in(&self, parent_id: &str) -> Result<(), EngineError> {
        // The retry window must outlast a full lease TTL: if the worker that
        // parked the parent crashed between its last write and its release,
        // the stale lease only becomes reclaimable once it expires. Giving
        // up any earlier would strand the parent in Waiting, since nothing
        // else scans for it.
        let deadline = tokio::time::Instant::now()
            + self.strategy_worker.lease_ttl()
            + self.options.fan_in_backoff * 2;
        loop {
            if let Some(mut handle) = self.strategy_worker.acquire_task(parent_id).await? {
                let resumed = self.resume_parent(handle.as_mut()).await;
                if let Err(err) = handle.done().await {
                    warn!(worker = %self.id, parent = parent_id, error = %err,
                          "lease release failed");
                }
                return resumed;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            sleep(self.options.fan_in_backoff).await;
        }
        // Past a full TTL the holder is alive and refreshing; the parent is
        // its responsibility now.
        warn!(worker = %self.id, parent = parent_id,
              "could not acquire parent for fan-in, leaving it to the lease holder");
        Ok(())
    }

    async fn resume_parent(&self, handle: &mut dyn TaskHandle) -> Result<(), EngineError> {
        let parent = handle.task().clone();
        if parent.state != TaskState::Waiting {
            return Ok(());
        }
        let strategy = self.dispatcher.strategy();
        for id in &parent.sub_task_ids {
            let sub = strategy
                .query_task(id)
                .await?
                .ok_or_else(|| EngineError::TaskNotFound(id.clone()))?;
            if !sub.state.is_terminal() {
                return Ok(());
            }
        }
        let mut updated = parent;
        updated.stage = updated.resume_to.take().unwrap_or_default();
        updated.state = TaskState::Pending;
        debug!(worker = %self.id, parent = %updated.id, stage = %updated.stage,
               "all sub-tasks finished, resuming parent");
        handle.update(updated).await
    }
}

/// A set of workers sharing one shutdown signal.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers onto the current runtime.
    pub fn spawn(dispatcher: &Arc<Dispatcher>, count: usize) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let joins = (0..count)
            .map(|i| {
                let worker = dispatcher.worker(format!("worker-{i}"));
                tokio::spawn(worker.run(rx.clone()))
            })
            .collect();
        Self { shutdown, joins }
    }

    /// Signal shutdown without waiting.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for every worker to exit.
    pub async fn shutdown_and_join(mut self) {
        self.request_shutdown();
        for join in self.joins.drain(..) {
            let _ = join.await;
        }
    }
}
