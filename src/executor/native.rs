//! The native backend for inline Rust bodies.

use async_trait::async_trait;

use super::{ExecutorBackend, MonitorSettings};
use crate::config::ExecConfig;
use crate::error::BackendError;
use crate::handler::{NativeBody, NativeTaskHandler, SharedTask, TaskHandler};

pub struct NativeExecutor;

impl NativeExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutorBackend for NativeExecutor {
    fn name(&self) -> &str {
        "native"
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
        native: Option<NativeBody>,
    ) -> Result<Box<dyn TaskHandler>, BackendError> {
        // No wrapper: the work dir still exists for outputs and provenance.
        {
            let task = task.lock().expect("task lock poisoned");
            std::fs::create_dir_all(&task.work_dir)?;
        }
        let body = native.ok_or_else(|| {
            BackendError::Submit("native executor requires an inline body".to_string())
        })?;
        Ok(Box::new(NativeTaskHandler::new(task, body)))
    }
}
