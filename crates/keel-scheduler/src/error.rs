//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task not queued: {0}")]
    TaskNotQueued(String),

    #[error("task not in progress: {0}")]
    TaskNotInProgress(String),

    #[error(transparent)]
    InvalidResourceId(#[from] keel_core::ResourceIdError),

    #[error("dependency cycle: {0}")]
    DependencyCycle(String),

    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("state store error: {0}")]
    State(#[from] keel_state::StateError),

    #[error("executor error: {0}")]
    Executor(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
