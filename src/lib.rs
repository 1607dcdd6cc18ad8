//! Weir - a dataflow task-execution engine
//!
//! Processes declare inputs, outputs and a script body; the engine runs
//! them as dataflow operators over channels. Each firing becomes an
//! isolated task: a work directory with staged inputs and a generated
//! shell wrapper, dispatched through a pluggable backend and cached by
//! content hash so reruns skip unchanged work. The key components are:
//!
//! ## Operators
//!
//! - [`ProcessBuilder`]: declares a process and launches it as a parallel
//!   (per-tuple) or merge (fold-to-single-task) operator
//! - [`dataflow`]: the channel primitives operators read and write
//!
//! ## Task lifecycle
//!
//! - [`TaskRun`]: the per-firing record
//! - [`TaskHandler`]: backend lifecycle token (submit / running / completed)
//! - [`TaskMonitor`]: per-backend admission queue and polling loop
//! - [`TaskDispatcher`]: backend routing and event fan-out
//!
//! ## Backends
//!
//! - [`executor::LocalExecutor`]: OS processes under the work directory
//! - [`executor::SlurmExecutor`]: SLURM-like batch scheduler adapter
//! - [`executor::NativeExecutor`]: inline Rust closures, no shell
//!
//! ## Caching
//!
//! - [`hash`]: content hashing over scripts and resolved inputs
//! - [`CacheIndex`]: hash → work-directory index behind `-resume`

pub mod cache;
pub mod config;
pub mod dataflow;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod executor;
pub mod handler;
pub mod hash;
pub mod monitor;
pub mod params;
pub mod processor;
pub mod session;
pub mod staging;
pub mod task;
pub mod trie;
pub mod value;
pub mod wrapper;

// Session wiring
pub use config::{ErrorStrategy, ExecConfig};
pub use session::Session;

// Operators
pub use dataflow::{channel, DataflowVariable, InputSource, Message};
pub use params::{InParam, OutParam};
pub use processor::{
    render_script, ProcessBuilder, ProcessHandle, ScriptBody, StateAccumulator, StateSnapshot,
};
pub use value::DataValue;

// Task lifecycle
pub use dispatcher::TaskDispatcher;
pub use error::{BackendError, ProcessError, StagingError, TaskError};
pub use events::{EventSink, TaskEvent};
pub use handler::{TaskHandler, TaskStatus};
pub use monitor::{MonitoredTask, TaskFinalizer, TaskMonitor};
pub use task::{TaskRun, EXIT_UNKNOWN};

// Staging and caching
pub use cache::{CacheIndex, CacheRecord};
pub use hash::{merge_hash, task_hash, CacheMode, HashBuilder};
pub use staging::FileHolder;
pub use trie::PathTrie;
