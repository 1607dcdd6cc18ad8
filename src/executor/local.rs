//! The local-process backend.

use async_trait::async_trait;

use super::{ExecutorBackend, MonitorSettings};
use crate::config::ExecConfig;
use crate::error::BackendError;
use crate::handler::{LocalTaskHandler, NativeBody, SharedTask, TaskHandler};
use crate::wrapper;

pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutorBackend for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    fn monitor_settings(&self, config: &ExecConfig) -> MonitorSettings {
        MonitorSettings {
            capacity: config.queue_size,
            poll_interval: config.poll_interval,
            queue_stat_interval: config.queue_stat_interval,
        }
    }

    async fn create_handler(
        &self,
        task: SharedTask,
        _native: Option<NativeBody>,
    ) -> Result<Box<dyn TaskHandler>, BackendError> {
        {
            let task = task.lock().expect("task lock poisoned");
            wrapper::materialize(&task)?;
        }
        Ok(Box::new(LocalTaskHandler::new(task)))
    }
}
