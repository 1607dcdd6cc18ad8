//! Native execution for inline Rust bodies.
//!
//! No shell is involved: submission schedules the closure on the blocking
//! pool, running means scheduled, completed means the join handle finished.
//! The closure's return value becomes the task's captured stdout.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::{SharedTask, StatusCell, TaskHandler, TaskStatus};
use crate::error::BackendError;
use crate::task::EXIT_UNKNOWN;
use crate::value::DataValue;

/// One firing's body: the user closure bound to its context map.
pub type NativeBody =
    Box<dyn FnOnce(HashMap<String, DataValue>) -> Result<DataValue, String> + Send + 'static>;

pub struct NativeTaskHandler {
    task: SharedTask,
    status: StatusCell,
    body: Option<NativeBody>,
    handle: Option<JoinHandle<Result<DataValue, String>>>,
}

impl NativeTaskHandler {
    pub fn new(task: SharedTask, body: NativeBody) -> Self {
        Self {
            task,
            status: StatusCell::new(),
            body: Some(body),
            handle: None,
        }
    }
}

#[async_trait]
impl TaskHandler for NativeTaskHandler {
    fn task(&self) -> &SharedTask {
        &self.task
    }

    fn status(&self) -> TaskStatus {
        self.status.get()
    }

    async fn submit(&mut self) -> Result<(), BackendError> {
        let body = self.body.take().ok_or_else(|| {
            BackendError::Submit("native task submitted twice".to_string())
        })?;
        let context = {
            let task = self.task.lock().expect("task lock poisoned");
            task.context.clone()
        };
        self.handle = Some(tokio::task::spawn_blocking(move || body(context)));
        self.status.advance(TaskStatus::Submitted);
        Ok(())
    }

    async fn check_if_running(&mut self) -> Result<bool, BackendError> {
        if self.status.get() == TaskStatus::Submitted && self.handle.is_some() {
            return Ok(self.status.advance(TaskStatus::Running));
        }
        Ok(false)
    }

    async fn check_if_completed(&mut self) -> Result<bool, BackendError> {
        if self.status.get() != TaskStatus::Running {
            return Ok(false);
        }
        let finished = self
            .handle
            .as_ref()
            .map(JoinHandle::is_finished)
            .unwrap_or(false);
        if !finished {
            return Ok(false);
        }
        let handle = self.handle.take().expect("handle checked above");
        let outcome = handle
            .await
            .unwrap_or_else(|err| Err(format!("native body panicked: {err}")));

        let mut task = self.task.lock().expect("task lock poisoned");
        match outcome {
            Ok(value) => {
                task.exit_status = 0;
                task.stdout_value = Some(value);
            }
            Err(message) => {
                task.exit_status = EXIT_UNKNOWN;
                task.error = Some(message);
            }
        }
        drop(task);
        Ok(self.status.advance(TaskStatus::Completed))
    }

    async fn kill(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        let mut task = self.task.lock().expect("task lock poisoned");
        if task.exit_status == EXIT_UNKNOWN {
            let name = task.display_name();
            task.error
                .get_or_insert_with(|| format!("task `{}` killed", name));
        }
        drop(task);
        self.status.advance(TaskStatus::Completed);
    }
}
