//! Demo flow: one job fans out a component task per requested color and
//! assembles the results once they all finish.
//!
//! Run with `RUST_LOG=flowline_core=debug` to watch the workers claim,
//! commit and fan in.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::info;

use flowline_core::{
    stage_fn, Context, Dispatcher, JobState, MemoryStore, SimpleStrategy, Strategy, TaskBuilder,
    TaskError, TaskExec, WorkerPool,
};

#[derive(Debug, Serialize, Deserialize)]
struct ProcessObjParams {
    components: Vec<String>,
}

fn process_obj_exec() -> TaskExec {
    TaskExec::new("process-obj")
        .entry(stage_fn(|ctx: Context| async move {
            let params: ProcessObjParams = ctx
                .get_params()?
                .ok_or_else(|| ctx.fail("missing params"))?;
            info!(task = ctx.task_id(), "creating {} components", params.components.len());
            for component in params.components {
                ctx.new_task("make-component").params(&component)?.submit();
            }
            ctx.resume_to("process");
            Ok::<_, TaskError>(())
        }))
        .stage(
            "process",
            stage_fn(|ctx: Context| async move {
                let mut assembled = Vec::new();
                for sub in ctx.sub_tasks().await.map_err(|e| ctx.fail(e))? {
                    assembled.push(sub.get_output::<String>()?.unwrap_or_default());
                }
                info!(task = ctx.task_id(), ?assembled, "assembled");
                ctx.set_output(&assembled)?;
                Ok::<_, TaskError>(())
            }),
        )
}

fn make_component_exec() -> TaskExec {
    TaskExec::new("make-component").entry(stage_fn(|ctx: Context| async move {
        let component: String = ctx
            .get_params()?
            .ok_or_else(|| ctx.fail("missing component name"))?;
        info!(task = ctx.task_id(), %component, "making component");
        sleep(Duration::from_millis(100)).await;
        ctx.set_output(&format!("{component}:done"))?;
        Ok::<_, TaskError>(())
    }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let strategy = Arc::new(SimpleStrategy::new(Arc::new(MemoryStore::new())));
    let mut dispatcher = Dispatcher::new(strategy.clone());
    dispatcher
        .add_task_execs([process_obj_exec(), make_component_exec()])
        .expect("executor names are unique");
    let dispatcher = Arc::new(dispatcher);

    let pool = WorkerPool::spawn(&dispatcher, 4);

    let params = ProcessObjParams {
        components: vec!["red".into(), "blue".into(), "green".into()],
    };
    let job = dispatcher
        .new_job()
        .name("simple-job")
        .task(
            TaskBuilder::new("process-obj")
                .params(&params)
                .expect("params encode")
                .build(),
        )
        .submit()
        .await
        .expect("job submission");
    info!(job = %job.id, "submitted");

    loop {
        let job = strategy
            .query_job(&job.id)
            .await
            .expect("query job")
            .expect("job exists");
        if matches!(job.state, JobState::Finished | JobState::Stuck) {
            let output: Vec<String> = job.task.get_output().expect("decode output").unwrap_or_default();
            info!(state = ?job.state, result = ?job.task.result, ?output, "job finished");
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    pool.shutdown_and_join().await;
}
