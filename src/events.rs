//! Task lifecycle event fan-out.
//!
//! Listeners observe submissions, starts, completions, cache hits and
//! failures. A listener error is logged and swallowed; it never disturbs
//! the pipeline.

use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::task::TaskId;

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Submitted {
        process: String,
        id: TaskId,
        name: String,
        hash: String,
    },
    Started {
        process: String,
        id: TaskId,
        name: String,
    },
    Completed {
        process: String,
        id: TaskId,
        name: String,
        exit_status: i32,
    },
    Cached {
        process: String,
        id: TaskId,
        name: String,
        hash: String,
    },
    Failed {
        process: String,
        id: TaskId,
        name: String,
        message: String,
    },
}

pub type Listener = Box<dyn Fn(&TaskEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventSink {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Listener) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener);
    }

    pub fn emit(&self, event: &TaskEvent) {
        let listeners = self.listeners.read().expect("listener lock poisoned");
        for listener in listeners.iter() {
            if let Err(err) = listener(event) {
                warn!(?event, %err, "task event listener failed");
            }
        }
    }
}
