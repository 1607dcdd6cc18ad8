//! SLURM-like grid backend.
//!
//! Submission shells out to `sbatch`, job state comes from a periodic
//! `squeue` snapshot, and kills go through `scancel`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{
    ExecutorBackend, GridCommands, MonitorSettings, QueueSnapshot, QueueSource, QueueStatus,
};
use crate::config::ExecConfig;
use crate::error::BackendError;
use crate::handler::{GridTaskHandler, NativeBody, SharedTask, TaskHandler};
use crate::task::TaskRun;
use crate::wrapper;

const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(90);

pub struct SlurmExecutor {
    inner: Arc<SlurmInner>,
    exit_grace: Duration,
}

struct SlurmInner {
    queue: Option<String>,
    snapshot: QueueSnapshot,
}

impl SlurmExecutor {
    pub fn new(queue: Option<String>) -> Self {
        Self {
            inner: Arc::new(SlurmInner {
                queue,
                snapshot: Arc::new(RwLock::new(HashMap::new())),
            }),
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn commands(&self) -> Arc<dyn GridCommands> {
        self.inner.clone()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.snapshot.clone()
    }
}

fn job_name(task: &TaskRun) -> String {
    let sanitized: String = task
        .display_name()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("weir-{sanitized}")
}

impl GridCommands for SlurmInner {
    fn submit_command(&self, task: &TaskRun, wrapper: &Path) -> Vec<String> {
        let mut argv = vec![
            "sbatch".to_string(),
            "-D".to_string(),
            task.work_dir.display().to_string(),
            "-J".to_string(),
            job_name(task),
            "-o".to_string(),
            "/dev/null".to_string(),
        ];
        if let Some(limit) = task.max_duration {
            argv.push("-t".to_string());
            argv.push(ExecConfig::walltime_spec(limit));
        }
        if let Some(queue) = &self.queue {
            argv.push("-p".to_string());
            argv.push(queue.clone());
        }
        argv.extend(task.cluster_options.iter().cloned());
        argv.push(wrapper.display().to_string());
        argv
    }

    fn kill_command(&self, job_id: &str) -> Vec<String> {
        vec!["scancel".to_string(), job_id.to_string()]
    }

    fn queue_command(&self, queue: Option<&str>) -> Vec<String> {
        let mut argv = vec![
            "squeue".to_string(),
            "-h".to_string(),
            "-o".to_string(),
            "%i %t".to_string(),
        ];
        if let Some(queue) = queue {
            argv.push("-p".to_string());
            argv.push(queue.to_string());
        }
        argv
    }

    fn parse_submit_id(&self, stdout: &str) -> Result<String, BackendError> {
        stdout
            .lines()
            .find(|line| line.contains("Submitted batch job"))
            .and_then(|line| line.split_whitespace().last())
            .map(str::to_string)
            .ok_or_else(|| BackendError::SubmitParse(stdout.to_string()))
    }

    fn parse_queue_status(&self, stdout: &str) -> HashMap<String, QueueStatus> {
        let mut map = HashMap::new();
        for line in stdout.lines() {
            let mut cols = line.split_whitespace();
            let (Some(id), Some(code)) = (cols.next(), cols.next()) else {
                continue;
            };
            let status = match code {
                "PD" => QueueStatus::Pending,
                "R" => QueueStatus::Running,
                "S" | "ST" => QueueStatus::Hold,
                "CA" | "F" | "NF" | "TO" => QueueStatus::Error,
                _ => QueueStatus::Unknown,
            };
            map.insert(id.to_string(), status);
        }
        map
    }
}

#[async_trait]
impl QueueSource for SlurmInner {
    async fn refresh(&self) -> Result<(), BackendError> {
        let argv = self.queue_command(self.queue.as_deref());
        let output = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(BackendError::Queue(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let parsed = self.parse_queue_status(&String::from_utf8_lossy(&output.stdout));
        debug!(jobs = parsed.len(), "refreshed queue snapshot");
        *self.snapshot.write().expect("snapshot lock poisoned") = parsed;
        Ok(())
    }
}

#[async_trait]
impl ExecutorBackend for SlurmExecutor {
    fn name(&self) -> &str {
        "slurm"
    }

    fn monitor_settings(&self, config: &ExecConfig) -> MonitorSettings {
        MonitorSettings {
            capacity: config.queue_size,
            poll_interval: config.poll_interval.max(Duration::from_millis(100)),
            queue_stat_interval: config.queue_stat_interval,
        }
    }

    fn queue_source(&self) -> Option<Arc<dyn QueueSource>> {
        Some(self.inner.clone())
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
        Ok(Box::new(GridTaskHandler::new(
            task,
            self.inner.clone(),
            self.inner.snapshot.clone(),
            self.exit_grace,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskRun;
    use std::collections::HashMap as StdHashMap;
    use std::path::PathBuf;

    fn task() -> TaskRun {
        let mut task = TaskRun::new("align", 7, 3);
        task.work_dir = PathBuf::from("/work/ab/cdef");
        task.script = "echo hi".into();
        task.cluster_options = vec!["--qos=short".into()];
        task.max_duration = Some(Duration::from_secs(3600));
        task
    }

    fn commands() -> Arc<dyn GridCommands> {
        SlurmExecutor::new(None).commands()
    }

    #[test]
    fn submit_argv_shape() {
        let argv = commands().submit_command(&task(), Path::new("/work/ab/cdef/.command.sh"));
        assert_eq!(
            argv,
            vec![
                "sbatch",
                "-D",
                "/work/ab/cdef",
                "-J",
                "weir-align__3_",
                "-o",
                "/dev/null",
                "-t",
                "01:00:00",
                "--qos=short",
                "/work/ab/cdef/.command.sh",
            ]
        );
    }

    #[test]
    fn submit_id_parses_from_stdout() {
        let id = commands().parse_submit_id("Submitted batch job 10\n").unwrap();
        assert_eq!(id, "10");
        assert!(commands().parse_submit_id("sbatch: error\n").is_err());
    }

    #[test]
    fn queue_status_maps_slurm_letters() {
        let parsed =
            commands().parse_queue_status("5 PD\n6 PD\n13 R\n14 CA\n15 F\n4 R");
        let expect: StdHashMap<String, QueueStatus> = [
            ("4", QueueStatus::Running),
            ("5", QueueStatus::Pending),
            ("6", QueueStatus::Pending),
            ("13", QueueStatus::Running),
            ("14", QueueStatus::Error),
            ("15", QueueStatus::Error),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        assert_eq!(parsed, expect);
    }

    #[test]
    fn kill_argv_is_scancel_id() {
        assert_eq!(commands().kill_command("123"), vec!["scancel", "123"]);
    }
}
