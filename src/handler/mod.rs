//! Backend-specific task lifecycle tokens.
//!
//! A handler drives exactly one [`TaskRun`] through
//! `New → Submitted → Running → Completed`. Transitions are monotonic and
//! idempotent; every change stamps `last_update`.

mod grid;
mod local;
mod native;

pub use grid::GridTaskHandler;
pub use local::LocalTaskHandler;
pub use native::{NativeBody, NativeTaskHandler};

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::task::TaskRun;

pub type SharedTask = Arc<Mutex<TaskRun>>;

/// Read the integer exit status the wrapper wrote, if present and parsable.
pub(crate) fn read_exit_file(path: &std::path::Path) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskStatus {
    New,
    Submitted,
    Running,
    Completed,
}

/// Monotonic status holder. Setting the same status twice, or moving
/// backwards, is a no-op.
pub struct StatusCell {
    inner: Mutex<(TaskStatus, Instant)>,
}

impl StatusCell {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((TaskStatus::New, Instant::now())),
        }
    }

    /// Returns true only when the transition actually happened.
    pub fn advance(&self, to: TaskStatus) -> bool {
        let mut guard = self.inner.lock().expect("status lock poisoned");
        if to <= guard.0 {
            return false;
        }
        *guard = (to, Instant::now());
        true
    }

    pub fn get(&self) -> TaskStatus {
        self.inner.lock().expect("status lock poisoned").0
    }

    pub fn last_update(&self) -> Instant {
        self.inner.lock().expect("status lock poisoned").1
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait TaskHandler: Send {
    fn task(&self) -> &SharedTask;

    fn status(&self) -> TaskStatus;

    /// Trigger the backend action and move `New → Submitted`.
    async fn submit(&mut self) -> Result<(), BackendError>;

    /// May move `Submitted → Running`. Returns true only at the transition.
    async fn check_if_running(&mut self) -> Result<bool, BackendError>;

    /// May move `Running → Completed`, reading the exit code and recording
    /// the stdout path. Returns true only at the transition; repeated calls
    /// past `Completed` return false.
    async fn check_if_completed(&mut self) -> Result<bool, BackendError>;

    /// Force termination at any post-`New` state.
    async fn kill(&mut self);
}

#[cfg(test)]
mod tests {
    use super::{StatusCell, TaskStatus};

    #[test]
    fn status_is_monotonic() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), TaskStatus::New);
        assert!(cell.advance(TaskStatus::Submitted));
        assert!(!cell.advance(TaskStatus::Submitted));
        assert!(cell.advance(TaskStatus::Completed));
        assert!(!cell.advance(TaskStatus::Running));
        assert_eq!(cell.get(), TaskStatus::Completed);
    }

    #[test]
    fn transitions_stamp_last_update() {
        let cell = StatusCell::new();
        let before = cell.last_update();
        std::thread::sleep(std::time::Duration::from_millis(2));
        cell.advance(TaskStatus::Submitted);
        assert!(cell.last_update() > before);
    }
}
