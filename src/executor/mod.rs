//! Executor backends.
//!
//! A backend is the factory side of task execution: it derives monitor
//! settings, pre-builds the wrapper, and hands out [`TaskHandler`]s. Grid
//! backends additionally describe their scheduler's submit/kill/queue wire
//! commands and parsers.

mod local;
mod native;
mod slurm;

pub use local::LocalExecutor;
pub use native::NativeExecutor;
pub use slurm::SlurmExecutor;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ExecConfig;
use crate::error::BackendError;
use crate::handler::{NativeBody, SharedTask, TaskHandler};
use crate::staging::FileHolder;
use crate::task::TaskRun;
use crate::wrapper;

/// Scheduler-reported job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Running,
    Hold,
    Error,
    Unknown,
}

/// The cached `{job id → status}` view grid handlers poll instead of
/// shelling out per task.
pub type QueueSnapshot = Arc<RwLock<HashMap<String, QueueStatus>>>;

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub capacity: usize,
    pub poll_interval: Duration,
    pub queue_stat_interval: Duration,
}

/// Refreshes the shared queue snapshot; driven by the monitor on its own
/// cadence.
#[async_trait]
pub trait QueueSource: Send + Sync {
    async fn refresh(&self) -> Result<(), BackendError>;
}

#[async_trait]
pub trait ExecutorBackend: Send + Sync {
    /// Backend class key; one monitor exists per key, session-wide.
    fn name(&self) -> &str;

    fn monitor_settings(&self, config: &ExecConfig) -> MonitorSettings;

    /// Present only for backends with an external queue to poll.
    fn queue_source(&self) -> Option<Arc<dyn QueueSource>> {
        None
    }

    /// Pre-build the wrapper and produce the lifecycle handler for one task.
    async fn create_handler(
        &self,
        task: SharedTask,
        native: Option<NativeBody>,
    ) -> Result<Box<dyn TaskHandler>, BackendError>;

    /// Stage-in script text for a set of holders.
    fn staging_script(&self, holders: &[FileHolder]) -> String {
        wrapper::stage_in_lines(holders)
    }

    /// Post-run stage-out script; empty for local filesystems.
    fn unstage_outputs_script(&self, _task: &TaskRun) -> String {
        String::new()
    }
}

/// Scheduler wire commands of a grid backend.
pub trait GridCommands: Send + Sync {
    fn submit_command(&self, task: &TaskRun, wrapper: &Path) -> Vec<String>;
    fn kill_command(&self, job_id: &str) -> Vec<String>;
    fn queue_command(&self, queue: Option<&str>) -> Vec<String>;
    fn parse_submit_id(&self, stdout: &str) -> Result<String, BackendError>;
    fn parse_queue_status(&self, stdout: &str) -> HashMap<String, QueueStatus>;
}

/// Resolve a backend by its configured name.
pub fn create(config: &ExecConfig) -> Result<Arc<dyn ExecutorBackend>, BackendError> {
    match config.executor.as_str() {
        "local" => Ok(Arc::new(LocalExecutor::new())),
        "slurm" => Ok(Arc::new(
            SlurmExecutor::new(config.queue.clone()).with_exit_grace(config.exit_read_grace),
        )),
        "native" => Ok(Arc::new(NativeExecutor::new())),
        other => Err(BackendError::UnknownExecutor(other.to_string())),
    }
}
