//! Error types for the staging, backend, task and process layers.

use std::path::PathBuf;
use std::time::Duration;

use crate::task::TaskId;

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("input file does not exist: {0}")]
    Missing(PathBuf),

    #[error("staging pattern `{pattern}` produces duplicate name `{name}`")]
    Conflict { pattern: String, name: String },

    #[error("pattern `{pattern}` expects a single file but received {count}")]
    Cardinality { pattern: String, count: usize },

    #[error("value `{0}` cannot be staged as a file")]
    NotAFile(String),

    #[error("pattern `{0}` ran out of single-character names")]
    CounterExhausted(String),
}

impl StagingError {
    /// Missing network paths are worth a retry; everything else is a
    /// declaration problem.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StagingError::Missing(path) if path.starts_with("//"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("submit command failed: {0}")]
    Submit(String),

    #[error("could not parse a job id from submit output: {0:?}")]
    SubmitParse(String),

    #[error("queue status command failed: {0}")]
    Queue(String),

    #[error("unknown executor `{0}`")]
    UnknownExecutor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task `{name}` ({id}) exited with status {status}")]
    NonZeroExit { name: String, id: TaskId, status: i32 },

    #[error("task `{name}` ({id}) exceeded its max duration of {limit:?}")]
    Walltime {
        name: String,
        id: TaskId,
        limit: Duration,
    },

    #[error("task `{name}` ({id}) produced no exit status")]
    MissingExitStatus { name: String, id: TaskId },

    #[error("task `{name}` staging failed: {source}")]
    Staging {
        name: String,
        #[source]
        source: StagingError,
    },

    #[error("task `{name}` backend failure: {source}")]
    Backend {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("task `{name}` ({id}) failed: {message}")]
    Failed {
        name: String,
        id: TaskId,
        message: String,
    },

    #[error("session terminated before task `{name}` completed")]
    Terminated { name: String },
}

impl TaskError {
    pub fn task_name(&self) -> &str {
        match self {
            TaskError::NonZeroExit { name, .. }
            | TaskError::Walltime { name, .. }
            | TaskError::MissingExitStatus { name, .. }
            | TaskError::Staging { name, .. }
            | TaskError::Backend { name, .. }
            | TaskError::Failed { name, .. }
            | TaskError::Terminated { name } => name,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process `{process}` is invalid: {message}")]
    Validation { process: String, message: String },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
