//! Routing tasks to the right monitor by backend class.
//!
//! One monitor exists per backend name, session-wide; the dispatcher builds
//! them lazily from the backend factory and fans lifecycle events out to
//! registered listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

use crate::config::ExecConfig;
use crate::error::TaskError;
use crate::events::{EventSink, TaskEvent};
use crate::executor::ExecutorBackend;
use crate::monitor::{MonitoredTask, TaskMonitor};

pub struct TaskDispatcher {
    monitors: Mutex<HashMap<String, Arc<TaskMonitor>>>,
    started: AtomicBool,
    events: EventSink,
}

impl TaskDispatcher {
    pub fn new(events: EventSink) -> Self {
        Self {
            monitors: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            events,
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// The monitor for a backend class, constructing it on first use.
    pub fn monitor_for(
        &self,
        backend: &Arc<dyn ExecutorBackend>,
        config: &ExecConfig,
    ) -> Arc<TaskMonitor> {
        let mut monitors = self.monitors.lock().expect("monitor map poisoned");
        if let Some(monitor) = monitors.get(backend.name()) {
            return monitor.clone();
        }
        let monitor = TaskMonitor::start(
            backend.name(),
            backend.monitor_settings(config),
            backend.queue_source(),
            self.events.clone(),
        );
        monitors.insert(backend.name().to_string(), monitor.clone());
        monitor
    }

    /// Enqueue a task on its backend's monitor; optionally block until it
    /// completes.
    pub async fn submit(
        &self,
        backend: &Arc<dyn ExecutorBackend>,
        config: &ExecConfig,
        mut monitored: MonitoredTask,
        await_termination: bool,
        message: &str,
    ) -> Result<(), TaskError> {
        let (process, id, name, hash) = {
            let task = monitored
                .handler
                .task()
                .lock()
                .expect("task lock poisoned");
            (
                task.process.clone(),
                task.id,
                task.display_name(),
                task.hash.clone(),
            )
        };
        debug!(task = %name, backend = backend.name(), "{message}");
        self.events.emit(&TaskEvent::Submitted {
            process,
            id,
            name: name.clone(),
            hash,
        });

        let latch_rx = if await_termination {
            let (tx, rx) = oneshot::channel();
            monitored.latch = Some(tx);
            Some(rx)
        } else {
            None
        };

        let monitor = self.monitor_for(backend, config);
        monitor.put(monitored).await?;

        if let Some(rx) = latch_rx {
            return match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(TaskError::Terminated { name }),
            };
        }
        Ok(())
    }

    /// Ask every monitor to kill the in-flight tasks of one process.
    pub fn kill_process_tasks(&self, process: &str) {
        let monitors = self.monitors.lock().expect("monitor map poisoned");
        for monitor in monitors.values() {
            monitor.kill_process_tasks(process);
        }
    }

    pub fn signal_complete(&self, backend_name: &str) {
        let monitors = self.monitors.lock().expect("monitor map poisoned");
        if let Some(monitor) = monitors.get(backend_name) {
            monitor.signal_complete();
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Stop every monitor; queued handlers are killed and latched callers
    /// released.
    pub async fn shutdown(&self) {
        let monitors: Vec<Arc<TaskMonitor>> = {
            let mut map = self.monitors.lock().expect("monitor map poisoned");
            map.drain().map(|(_, monitor)| monitor).collect()
        };
        for monitor in monitors {
            monitor.stop().await;
        }
    }
}
