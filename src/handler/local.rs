//! Local process execution.
//!
//! Submission spawns the wrapper as an OS process under the task work
//! directory with stdout and stderr redirected to the output file. The
//! spawned child is the running signal; its exit result the completed
//! signal. A configured max duration forces completion on overflow.

use std::fs::File;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{read_exit_file, SharedTask, StatusCell, TaskHandler, TaskStatus};
use crate::error::BackendError;
use crate::task::EXIT_UNKNOWN;

pub struct LocalTaskHandler {
    task: SharedTask,
    status: StatusCell,
    child: Option<Child>,
    started_at: Option<Instant>,
    max_duration: Option<Duration>,
}

impl LocalTaskHandler {
    pub fn new(task: SharedTask) -> Self {
        let max_duration = task.lock().expect("task lock poisoned").max_duration;
        Self {
            task,
            status: StatusCell::new(),
            child: None,
            started_at: None,
            max_duration,
        }
    }

    fn force_walltime_exit(&mut self) {
        let mut task = self.task.lock().expect("task lock poisoned");
        task.exit_status = EXIT_UNKNOWN;
        task.timed_out = true;
        task.stdout_path = Some(task.out_file());
        task.error = Some(format!(
            "task `{}` exceeded its max duration of {:?}",
            task.display_name(),
            self.max_duration.unwrap_or_default()
        ));
    }
}

#[async_trait]
impl TaskHandler for LocalTaskHandler {
    fn task(&self) -> &SharedTask {
        &self.task
    }

    fn status(&self) -> TaskStatus {
        self.status.get()
    }

    async fn submit(&mut self) -> Result<(), BackendError> {
        let (work_dir, wrapper, out_file, name) = {
            let task = self.task.lock().expect("task lock poisoned");
            (
                task.work_dir.clone(),
                task.wrapper_path(),
                task.out_file(),
                task.display_name(),
            )
        };

        let stdout = File::create(&out_file)?;
        let stderr = stdout.try_clone()?;
        let child = Command::new("/bin/bash")
            .arg(&wrapper)
            .current_dir(&work_dir)
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()?;

        debug!(task = %name, pid = child.id(), dir = %work_dir.display(), "spawned local task");
        self.started_at = Some(Instant::now());
        self.child = Some(child);
        self.status.advance(TaskStatus::Submitted);
        Ok(())
    }

    async fn check_if_running(&mut self) -> Result<bool, BackendError> {
        if self.status.get() == TaskStatus::Submitted && self.child.is_some() {
            return Ok(self.status.advance(TaskStatus::Running));
        }
        Ok(false)
    }

    async fn check_if_completed(&mut self) -> Result<bool, BackendError> {
        if self.status.get() != TaskStatus::Running {
            return Ok(false);
        }

        if let (Some(limit), Some(started)) = (self.max_duration, self.started_at) {
            if started.elapsed() > limit {
                if let Some(child) = self.child.as_mut() {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                self.child = None;
                self.force_walltime_exit();
                warn!(limit = ?limit, "local task killed on max duration overflow");
                return Ok(self.status.advance(TaskStatus::Completed));
            }
        }

        let Some(child) = self.child.as_mut() else {
            return Ok(false);
        };
        match child.try_wait()? {
            Some(exit) => {
                let mut task = self.task.lock().expect("task lock poisoned");
                let code = exit
                    .code()
                    .or_else(|| read_exit_file(&task.exit_file()))
                    .unwrap_or(EXIT_UNKNOWN);
                task.exit_status = code;
                task.stdout_path = Some(task.out_file());
                drop(task);
                self.child = None;
                Ok(self.status.advance(TaskStatus::Completed))
            }
            None => Ok(false),
        }
    }

    async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.child = None;
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
