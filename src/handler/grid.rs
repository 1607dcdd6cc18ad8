//! Grid (batch scheduler) execution.
//!
//! Submission shells out the backend's submit command and parses a job id
//! from its stdout. State checks read the monitor's shared queue snapshot;
//! a job gone from the queue is probed for `.exitcode` with a grace period
//! before being declared failed.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{read_exit_file, SharedTask, StatusCell, TaskHandler, TaskStatus};
use crate::error::BackendError;
use crate::executor::{GridCommands, QueueSnapshot, QueueStatus};
use crate::task::EXIT_UNKNOWN;

pub struct GridTaskHandler {
    task: SharedTask,
    status: StatusCell,
    commands: Arc<dyn GridCommands>,
    snapshot: QueueSnapshot,
    job_id: Option<String>,
    missing_since: Option<Instant>,
    exit_grace: Duration,
}

impl GridTaskHandler {
    pub fn new(
        task: SharedTask,
        commands: Arc<dyn GridCommands>,
        snapshot: QueueSnapshot,
        exit_grace: Duration,
    ) -> Self {
        Self {
            task,
            status: StatusCell::new(),
            commands,
            snapshot,
            job_id: None,
            missing_since: None,
            exit_grace,
        }
    }

    fn queue_status(&self) -> Option<QueueStatus> {
        let job_id = self.job_id.as_ref()?;
        self.snapshot
            .read()
            .expect("snapshot lock poisoned")
            .get(job_id)
            .copied()
    }

    fn complete(&mut self, exit_status: i32, error: Option<String>) -> bool {
        let mut task = self.task.lock().expect("task lock poisoned");
        task.exit_status = exit_status;
        task.stdout_path = Some(task.out_file());
        if let Some(message) = error {
            task.error.get_or_insert(message);
        }
        drop(task);
        self.status.advance(TaskStatus::Completed)
    }
}

#[async_trait]
impl TaskHandler for GridTaskHandler {
    fn task(&self) -> &SharedTask {
        &self.task
    }

    fn status(&self) -> TaskStatus {
        self.status.get()
    }

    async fn submit(&mut self) -> Result<(), BackendError> {
        let (argv, work_dir, name) = {
            let task = self.task.lock().expect("task lock poisoned");
            (
                self.commands.submit_command(&task, &task.wrapper_path()),
                task.work_dir.clone(),
                task.display_name(),
            )
        };
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(BackendError::Submit(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = self.commands.parse_submit_id(&stdout)?;
        debug!(task = %name, job_id = %job_id, "submitted grid task");
        self.job_id = Some(job_id);
        self.status.advance(TaskStatus::Submitted);
        Ok(())
    }

    async fn check_if_running(&mut self) -> Result<bool, BackendError> {
        if self.status.get() != TaskStatus::Submitted {
            return Ok(false);
        }
        // A job absent from the snapshot may have started and finished
        // between refreshes; treat it as running and let the completion
        // probe sort it out.
        match self.queue_status() {
            Some(QueueStatus::Pending) | Some(QueueStatus::Hold) => Ok(false),
            _ => Ok(self.status.advance(TaskStatus::Running)),
        }
    }

    async fn check_if_completed(&mut self) -> Result<bool, BackendError> {
        if self.status.get() != TaskStatus::Running {
            return Ok(false);
        }

        let exit_file = {
            let task = self.task.lock().expect("task lock poisoned");
            task.exit_file()
        };
        if exit_file.exists() {
            let code = read_exit_file(&exit_file).unwrap_or(EXIT_UNKNOWN);
            return Ok(self.complete(code, None));
        }

        match self.queue_status() {
            Some(QueueStatus::Error) => {
                warn!(job_id = ?self.job_id, "scheduler reported job error");
                Ok(self.complete(
                    EXIT_UNKNOWN,
                    Some("scheduler reported job error".to_string()),
                ))
            }
            Some(_) => {
                self.missing_since = None;
                Ok(false)
            }
            None => {
                let since = *self.missing_since.get_or_insert_with(Instant::now);
                if since.elapsed() > self.exit_grace {
                    warn!(job_id = ?self.job_id, "job left the queue without an exit file");
                    Ok(self.complete(
                        EXIT_UNKNOWN,
                        Some("job left the queue without an exit status".to_string()),
                    ))
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn kill(&mut self) {
        if let Some(job_id) = &self.job_id {
            let argv = self.commands.kill_command(job_id);
            let result = Command::new(&argv[0])
                .args(&argv[1..])
                .stdin(Stdio::null())
                .output()
                .await;
            if let Err(err) = result {
                warn!(job_id = %job_id, %err, "kill command failed");
            }
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
