//! Executor registry and engine entry point.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::JobBuilder;
use crate::error::EngineError;
use crate::exec::{Stage, TaskExec};
use crate::strategy::Strategy;
use crate::worker::{Worker, WorkerOptions};

/// Binds task executors to a scheduling strategy and spawns workers.
///
/// The dispatcher is immutable once workers run; register every executor
/// before spawning.
pub struct Dispatcher {
    strategy: Arc<dyn Strategy>,
    execs: HashMap<String, TaskExec>,
    worker_options: WorkerOptions,
}

impl Dispatcher {
    pub fn new(strategy: Arc<dyn Strategy>) -> Self {
        Self {
            strategy,
            execs: HashMap::new(),
            worker_options: WorkerOptions::default(),
        }
    }

    pub fn with_worker_options(mut self, options: WorkerOptions) -> Self {
        self.worker_options = options;
        self
    }

    /// Register executors by task name. Names must be unique.
    pub fn add_task_execs(
        &mut self,
        execs: impl IntoIterator<Item = TaskExec>,
    ) -> Result<(), EngineError> {
        for exec in execs {
            let name = exec.name().to_string();
            if self.execs.contains_key(&name) {
                return Err(EngineError::DuplicateExec(name));
            }
            self.execs.insert(name, exec);
        }
        Ok(())
    }

    pub fn strategy(&self) -> Arc<dyn Strategy> {
        self.strategy.clone()
    }

    /// Start building a job for submission through the bound strategy.
    pub fn new_job(&self) -> JobBuilder {
        JobBuilder::new(self.strategy.clone())
    }

    /// Create a worker bound to this dispatcher. Drive it with
    /// [`Worker::run`] or use [`crate::worker::WorkerPool`].
    pub fn worker(self: &Arc<Self>, id: impl Into<String>) -> Worker {
        Worker::new(id.into(), self.clone(), self.worker_options.clone())
    }

    pub(crate) fn find_stage(&self, task_name: &str, stage: &str) -> Option<&Stage> {
        self.execs.get(task_name)?.find_stage(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::stage_fn;
    use crate::store::MemoryStore;
    use crate::strategy::SimpleStrategy;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(SimpleStrategy::new(Arc::new(MemoryStore::new()))))
    }

    fn noop_exec(name: &str) -> TaskExec {
        TaskExec::new(name).entry(stage_fn(|_ctx| async {
            Ok::<_, crate::domain::TaskError>(())
        }))
    }

    #[test]
    fn duplicate_executor_names_are_rejected() {
        let mut dispatcher = dispatcher();
        dispatcher
            .add_task_execs([noop_exec("process-obj"), noop_exec("make-component")])
            .unwrap();
        let err = dispatcher
            .add_task_execs([noop_exec("process-obj")])
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateExec(name) if name == "process-obj"));
    }

    #[test]
    fn stage_lookup_spans_executor_and_stage() {
        let mut dispatcher = dispatcher();
        let exec = TaskExec::new("process-obj")
            .entry(stage_fn(|_ctx| async {
                Ok::<_, crate::domain::TaskError>(())
            }))
            .stage(
                "assemble",
                stage_fn(|_ctx| async { Ok::<_, crate::domain::TaskError>(()) }),
            );
        dispatcher.add_task_execs([exec]).unwrap();

        assert!(dispatcher.find_stage("process-obj", "").is_some());
        assert!(dispatcher.find_stage("process-obj", "assemble").is_some());
        assert!(dispatcher.find_stage("process-obj", "missing").is_none());
        assert!(dispatcher.find_stage("unknown-task", "").is_none());
    }
}
