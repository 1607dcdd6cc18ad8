//! Session-scoped wiring.
//!
//! A session owns the work directory, the dispatcher with its per-backend
//! monitors, the cache index and the event sink. Everything is created at
//! session start and torn down at session end; there are no process-wide
//! singletons.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;
use uuid::Uuid;

use crate::cache::CacheIndex;
use crate::config::ExecConfig;
use crate::dispatcher::TaskDispatcher;
use crate::error::{BackendError, ProcessError, TaskError};
use crate::events::{EventSink, Listener};
use crate::executor::{self, ExecutorBackend};

pub struct Session {
    /// Unique per run.
    pub id: Uuid,
    /// Stable across runs of the same workflow; the cache identity.
    pub workflow_id: String,
    pub work_dir: PathBuf,
    pub config: ExecConfig,
    dispatcher: Arc<TaskDispatcher>,
    cache: Arc<CacheIndex>,
    events: EventSink,
    /// One backend instance per class, shared by every process using it so
    /// grid handlers and their monitor poll the same queue snapshot.
    backends: Mutex<HashMap<String, Arc<dyn ExecutorBackend>>>,
    first_error: Mutex<Option<TaskError>>,
    aborted: AtomicBool,
}

impl Session {
    pub fn new(
        workflow_id: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        config: ExecConfig,
    ) -> Result<Arc<Self>, ProcessError> {
        let workflow_id = workflow_id.into();
        let work_dir = work_dir.into();
        std::fs::create_dir_all(&work_dir)?;

        let events = EventSink::new();
        let cache = Arc::new(CacheIndex::open(&work_dir, &workflow_id, config.resume)?);
        let dispatcher = Arc::new(TaskDispatcher::new(events.clone()));
        dispatcher.start();

        let id = Uuid::new_v4();
        info!(
            session = %id,
            workflow = %workflow_id,
            work_dir = %work_dir.display(),
            resume = config.resume,
            "session started",
        );
        Ok(Arc::new(Self {
            id,
            workflow_id,
            work_dir,
            config,
            dispatcher,
            cache,
            events,
            backends: Mutex::new(HashMap::new()),
            first_error: Mutex::new(None),
            aborted: AtomicBool::new(false),
        }))
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// The shared backend instance for `config.executor`, constructed on
    /// first use.
    pub fn backend_for(
        &self,
        config: &ExecConfig,
    ) -> Result<Arc<dyn ExecutorBackend>, BackendError> {
        let mut backends = self.backends.lock().expect("backend map poisoned");
        if let Some(backend) = backends.get(&config.executor) {
            return Ok(backend.clone());
        }
        let backend = executor::create(config)?;
        backends.insert(config.executor.clone(), backend.clone());
        Ok(backend)
    }

    pub fn cache(&self) -> &Arc<CacheIndex> {
        &self.cache
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn on_event(&self, listener: Listener) {
        self.events.subscribe(listener);
    }

    /// Record the first fatal error; later errors are dropped.
    pub fn record_error(&self, error: TaskError) {
        let mut guard = self.first_error.lock().expect("error lock poisoned");
        if guard.is_none() {
            *guard = Some(error);
        }
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn take_first_error(&self) -> Option<TaskError> {
        self.first_error.lock().expect("error lock poisoned").take()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Stop every monitor: queued handlers are killed, latched callers
    /// released with a terminated error.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
        info!(session = %self.id, "session shut down");
    }
}
