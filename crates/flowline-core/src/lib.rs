//! flowline-core
//!
//! A job execution engine built from four replaceable layers:
//!
//! - **domain**: jobs, tasks, classified errors and the lifecycle records
//! - **store**: minimal persistence contract (buckets, ordered lists, locks)
//!   plus an in-memory implementation for development and tests
//! - **strategy**: scheduling semantics over a store; ships a FIFO-with-leases
//!   reference strategy
//! - **dispatcher / worker / context / exec**: the execution engine binding
//!   stage functions to claimed tasks
//!
//! A job is a tree of tasks. Each task runs stage by stage; a stage can stash
//! data, fan out sub-tasks and park the task until they finish, or classify a
//! failure to retry, roll back, park or ignore it. Workers coordinate purely
//! through the store, so any number of processes can share one queue.

pub mod context;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod exec;
pub mod store;
pub mod strategy;
pub mod worker;

mod lifecycle;

pub use context::{Context, SubTaskBuilder};
pub use dispatcher::Dispatcher;
pub use domain::{
    BoxError, Job, JobBuilder, JobState, Task, TaskBuilder, TaskError, TaskErrorKind, TaskResult,
    TaskState, TaskStats,
};
pub use error::EngineError;
pub use exec::{non_revertable, revertable, stage_fn, Stage, StageFn, StageFuture, TaskExec};
pub use store::{MemoryStore, Store};
pub use strategy::{SimpleStrategy, Strategy, TaskHandle, WorkerStrategy};
pub use worker::{Worker, WorkerOptions, WorkerPool};
