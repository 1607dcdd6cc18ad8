//! The per-firing task record.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::staging::FileHolder;
use crate::value::DataValue;

pub type TaskId = u64;

/// Exit status sentinel while the real code is unknown.
pub const EXIT_UNKNOWN: i32 = i32::MAX;

/// Well-known file names inside a task work directory.
pub const WRAPPER_FILE: &str = ".command.sh";
pub const RUN_FILE: &str = ".command.run";
pub const ENV_FILE: &str = ".command.env";
pub const OUT_FILE: &str = ".command.out";
pub const STDIN_FILE: &str = ".command.in";
pub const EXIT_FILE: &str = ".exitcode";

/// One invocation of a process on a specific tuple of input values.
///
/// Created at firing time, mutated by setup, the wrapper build, the handler
/// and output collection, then dropped once outputs are bound.
#[derive(Debug)]
pub struct TaskRun {
    pub id: TaskId,
    /// Owning process name.
    pub process: String,
    /// Submission ordinal within the process, starting at 1.
    pub index: u64,
    /// Retry ordinal, starting at 1.
    pub attempt: u32,
    pub work_dir: PathBuf,
    /// Rendered command text.
    pub script: String,
    /// Interpreter line when the script declared one (`#!...`).
    pub shebang: Option<String>,
    /// Name → value map the script was rendered against.
    pub context: HashMap<String, DataValue>,
    /// Ordered `(name, value)` pairs, the hash input.
    pub inputs: Vec<(String, DataValue)>,
    /// Files to link into the work directory. Merge tasks carry the union
    /// of every folded firing.
    pub staged: Vec<FileHolder>,
    /// Extra generated files written at handler-creation time
    /// (per-firing command files of a merge task).
    pub aux_files: Vec<(String, String)>,
    /// True when the script text already carries its own stage-in lines
    /// (merge tasks); the wrapper then skips its stage-in block.
    pub embedded_staging: bool,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    pub container: Option<String>,
    pub cluster_options: Vec<String>,
    pub max_duration: Option<Duration>,
    pub hash: String,
    pub exit_status: i32,
    /// Set when the handler forced completion on walltime overflow.
    pub timed_out: bool,
    pub stdout_path: Option<PathBuf>,
    /// Captured value for native (closure) tasks, in place of a stdout file.
    pub stdout_value: Option<DataValue>,
    pub error: Option<String>,
}

impl TaskRun {
    pub fn new(process: impl Into<String>, id: TaskId, index: u64) -> Self {
        Self {
            id,
            process: process.into(),
            index,
            attempt: 1,
            work_dir: PathBuf::new(),
            script: String::new(),
            shebang: None,
            context: HashMap::new(),
            inputs: Vec::new(),
            staged: Vec::new(),
            aux_files: Vec::new(),
            embedded_staging: false,
            env: Vec::new(),
            stdin: None,
            container: None,
            cluster_options: Vec::new(),
            max_duration: None,
            hash: String::new(),
            exit_status: EXIT_UNKNOWN,
            timed_out: false,
            stdout_path: None,
            stdout_value: None,
            error: None,
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} ({})", self.process, self.index)
    }

    pub fn wrapper_path(&self) -> PathBuf {
        self.work_dir.join(WRAPPER_FILE)
    }

    pub fn exit_file(&self) -> PathBuf {
        self.work_dir.join(EXIT_FILE)
    }

    pub fn out_file(&self) -> PathBuf {
        self.work_dir.join(OUT_FILE)
    }

    pub fn env_file(&self) -> PathBuf {
        self.work_dir.join(ENV_FILE)
    }

    pub fn stdin_file(&self) -> PathBuf {
        self.work_dir.join(STDIN_FILE)
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == 0 && self.error.is_none()
    }
}
