use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the engine and strategy layer.
///
/// Distinct from [`crate::domain::TaskError`]: that one classifies stage
/// failures and is persisted with the task; this one reports engine and
/// storage problems to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("document codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("lease lost for task {0}")]
    LeaseLost(String),

    #[error("duplicate task executor: {0}")]
    DuplicateExec(String),

    #[error("sub-task {0} has not reached a terminal state")]
    SubTaskNotTerminal(String),

    #[error("job has no root task")]
    MissingRootTask,
}
