//! Per-backend admission queue and polling loop.
//!
//! A monitor owns a fixed-capacity FIFO of [`MonitoredTask`]s and a single
//! polling worker that admits, submits, and advances handlers through their
//! states. `put` blocks when the FIFO is full, which is the engine's
//! backpressure edge: operators stall at submission until slots free up.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Notify, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::events::{EventSink, TaskEvent};
use crate::executor::{MonitorSettings, QueueSource};
use crate::handler::{SharedTask, TaskHandler, TaskStatus};
use crate::task::{TaskRun, EXIT_UNKNOWN};

/// Consecutive queue-refresh failures tolerated before every owned handler
/// is marked failed.
const MAX_QUEUE_FAILURES: u32 = 5;

/// Collects outputs and routes errors once a task leaves the monitor.
/// Implemented by the owning process.
#[async_trait]
pub trait TaskFinalizer: Send + Sync {
    async fn finalize(&self, task: SharedTask, outcome: Result<(), TaskError>);
}

/// A handler packaged with everything the monitor needs at completion.
pub struct MonitoredTask {
    pub handler: Box<dyn TaskHandler>,
    pub finalizer: Arc<dyn TaskFinalizer>,
    /// Released with the task outcome when a caller blocks on completion.
    pub latch: Option<oneshot::Sender<Result<(), TaskError>>>,
    /// The owning process's in-flight permit; dropped after finalize.
    pub permit: Option<OwnedSemaphorePermit>,
}

/// Derive the task outcome from its post-completion state.
pub(crate) fn outcome_of(task: &TaskRun) -> Result<(), TaskError> {
    if task.timed_out {
        return Err(TaskError::Walltime {
            name: task.display_name(),
            id: task.id,
            limit: task.max_duration.unwrap_or_default(),
        });
    }
    if let Some(message) = &task.error {
        return Err(TaskError::Failed {
            name: task.display_name(),
            id: task.id,
            message: message.clone(),
        });
    }
    match task.exit_status {
        0 => Ok(()),
        EXIT_UNKNOWN => Err(TaskError::MissingExitStatus {
            name: task.display_name(),
            id: task.id,
        }),
        status => Err(TaskError::NonZeroExit {
            name: task.display_name(),
            id: task.id,
            status,
        }),
    }
}

pub struct TaskMonitor {
    name: String,
    tx: mpsc::Sender<MonitoredTask>,
    wake: Arc<Notify>,
    kill_requests: Arc<Mutex<HashSet<String>>>,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskMonitor {
    /// Construct and start the polling worker.
    pub fn start(
        name: impl Into<String>,
        settings: MonitorSettings,
        queue_source: Option<Arc<dyn QueueSource>>,
        events: EventSink,
    ) -> Arc<Self> {
        let name = name.into();
        let capacity = settings.capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let wake = Arc::new(Notify::new());
        let kill_requests = Arc::new(Mutex::new(HashSet::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = MonitorWorker {
            name: name.clone(),
            capacity,
            settings,
            rx,
            wake: wake.clone(),
            kill_requests: kill_requests.clone(),
            shutdown_rx,
            queue_source,
            queue_failures: 0,
            events,
            active: Vec::new(),
        };
        let handle = tokio::spawn(worker.run());

        info!(
            monitor = %name,
            capacity,
            poll_interval_ms = settings.poll_interval.as_millis() as u64,
            "started task monitor",
        );
        Arc::new(Self {
            name,
            tx,
            wake,
            kill_requests,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a task; blocks while the FIFO is full.
    pub async fn put(&self, task: MonitoredTask) -> Result<(), TaskError> {
        let name = {
            let task = task.handler.task().lock().expect("task lock poisoned");
            task.display_name()
        };
        self.tx
            .send(task)
            .await
            .map_err(|_| TaskError::Terminated { name })?;
        self.wake.notify_one();
        Ok(())
    }

    /// Wake the poller ahead of its next tick.
    pub fn signal_complete(&self) {
        self.wake.notify_one();
    }

    /// Kill every active handler belonging to `process` on the next tick.
    pub fn kill_process_tasks(&self, process: &str) {
        self.kill_requests
            .lock()
            .expect("kill set poisoned")
            .insert(process.to_string());
        self.wake.notify_one();
    }

    /// Stop the worker: queued and active handlers are killed, latched
    /// callers released with a terminated error.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().expect("handle lock poisoned").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(monitor = %self.name, ?err, "monitor worker panicked");
            }
        }
    }
}

struct MonitorWorker {
    name: String,
    capacity: usize,
    settings: MonitorSettings,
    rx: mpsc::Receiver<MonitoredTask>,
    wake: Arc<Notify>,
    kill_requests: Arc<Mutex<HashSet<String>>>,
    shutdown_rx: watch::Receiver<bool>,
    queue_source: Option<Arc<dyn QueueSource>>,
    queue_failures: u32,
    events: EventSink,
    active: Vec<MonitoredTask>,
}

impl MonitorWorker {
    async fn run(mut self) {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut queue_ticker = interval(self.settings.queue_stat_interval);
        queue_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll().await;
                }
                _ = queue_ticker.tick(), if self.queue_source.is_some() => {
                    self.refresh_queue().await;
                    self.poll().await;
                }
                _ = self.wake.notified() => {
                    self.poll().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!(monitor = %self.name, "monitor shutting down");
                        break;
                    }
                }
            }
        }
        self.drain().await;
    }

    async fn refresh_queue(&mut self) {
        let Some(source) = self.queue_source.clone() else {
            return;
        };
        match source.refresh().await {
            Ok(()) => self.queue_failures = 0,
            Err(err) => {
                self.queue_failures += 1;
                warn!(
                    monitor = %self.name,
                    failures = self.queue_failures,
                    %err,
                    "queue status refresh failed",
                );
                if self.queue_failures >= MAX_QUEUE_FAILURES {
                    error!(monitor = %self.name, "queue unreachable, failing owned tasks");
                    let active = std::mem::take(&mut self.active);
                    for mut entry in active {
                        entry.handler.kill().await;
                        set_task_error(entry.handler.task(), "backend queue unreachable");
                        Self::finish(entry).await;
                    }
                    self.queue_failures = 0;
                }
            }
        }
    }

    async fn poll(&mut self) {
        self.apply_kill_requests().await;

        // Admission: fill the active set from the FIFO up to capacity.
        while self.active.len() < self.capacity {
            match self.rx.try_recv() {
                Ok(entry) => self.active.push(entry),
                Err(_) => break,
            }
        }

        // Submit new handlers in insertion order.
        for entry in &mut self.active {
            if entry.handler.status() == TaskStatus::New {
                if let Err(err) = entry.handler.submit().await {
                    warn!(monitor = %self.name, %err, "task submission failed");
                    set_task_error(entry.handler.task(), &format!("submit failed: {err}"));
                }
            }
        }

        // Advance states; completed or failed handlers leave the set.
        let mut index = 0;
        while index < self.active.len() {
            let entry = &mut self.active[index];
            if task_has_error(entry.handler.task()) && entry.handler.status() < TaskStatus::Completed
            {
                let mut entry = self.active.swap_remove(index);
                entry.handler.kill().await;
                Self::finish(entry).await;
                continue;
            }

            match Self::advance(entry, &self.events).await {
                Ok(true) => {
                    let entry = self.active.swap_remove(index);
                    Self::finish(entry).await;
                }
                Ok(false) => index += 1,
                Err(err) => {
                    warn!(monitor = %self.name, %err, "handler check failed");
                    set_task_error(entry.handler.task(), &format!("backend check failed: {err}"));
                    let mut entry = self.active.swap_remove(index);
                    entry.handler.kill().await;
                    Self::finish(entry).await;
                }
            }
        }
    }

    /// Drive one handler; true when it just completed.
    async fn advance(
        entry: &mut MonitoredTask,
        events: &EventSink,
    ) -> Result<bool, crate::error::BackendError> {
        if entry.handler.check_if_running().await? {
            let (process, id, name) = {
                let task = entry.handler.task().lock().expect("task lock poisoned");
                (task.process.clone(), task.id, task.display_name())
            };
            debug!(task = %name, "task started");
            events.emit(&TaskEvent::Started { process, id, name });
        }
        entry.handler.check_if_completed().await
    }

    async fn finish(entry: MonitoredTask) {
        let MonitoredTask {
            handler,
            finalizer,
            latch,
            permit,
        } = entry;
        let task = handler.task().clone();
        let outcome = {
            let task = task.lock().expect("task lock poisoned");
            outcome_of(&task)
        };
        finalizer.finalize(task.clone(), outcome).await;
        if let Some(latch) = latch {
            let outcome = {
                let task = task.lock().expect("task lock poisoned");
                outcome_of(&task)
            };
            let _ = latch.send(outcome);
        }
        drop(permit);
    }

    async fn drain(&mut self) {
        // Kill whatever is still queued or active; finalization routes the
        // kill through the owning process and releases any latch.
        while let Ok(entry) = self.rx.try_recv() {
            self.active.push(entry);
        }
        let active = std::mem::take(&mut self.active);
        for mut entry in active {
            entry.handler.kill().await;
            set_task_error(entry.handler.task(), "session terminated");
            Self::finish(entry).await;
        }
    }

    async fn apply_kill_requests(&mut self) {
        let requests: HashSet<String> = {
            let mut guard = self.kill_requests.lock().expect("kill set poisoned");
            std::mem::take(&mut *guard)
        };
        if requests.is_empty() {
            return;
        }
        let mut index = 0;
        while index < self.active.len() {
            let process = {
                let task = self.active[index]
                    .handler
                    .task()
                    .lock()
                    .expect("task lock poisoned");
                task.process.clone()
            };
            if requests.contains(&process) {
                let mut entry = self.active.swap_remove(index);
                entry.handler.kill().await;
                Self::finish(entry).await;
            } else {
                index += 1;
            }
        }
    }
}

fn task_has_error(task: &SharedTask) -> bool {
    task.lock().expect("task lock poisoned").error.is_some()
}

fn set_task_error(task: &SharedTask, message: &str) {
    let mut task = task.lock().expect("task lock poisoned");
    task.error.get_or_insert_with(|| message.to_string());
}
