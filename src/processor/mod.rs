//! Process operators: declaration, input resolution, output binding.
//!
//! A process declares inputs, outputs and a script body; launching it
//! spawns a dataflow operator that turns each input tuple into a task
//! firing. The parallel operator fires per tuple; the merge operator folds
//! every tuple into one final task submitted on termination.

mod merge;
mod parallel;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cache::CacheRecord;
use crate::config::{ErrorStrategy, ExecConfig};
use crate::dataflow::{self, InputSource, Sender};
use crate::error::{ProcessError, StagingError, TaskError};
use crate::events::TaskEvent;
use crate::executor::ExecutorBackend;
use crate::handler::{NativeBody, SharedTask};
use crate::hash::{task_hash, CacheMode};
use crate::monitor::{MonitoredTask, TaskFinalizer};
use crate::params::{InParam, InPort, OutParam, OutPort};
use crate::staging::{self, FileHolder};
use crate::task::{TaskRun, OUT_FILE};
use crate::value::DataValue;
use crate::Session;

use async_trait::async_trait;

/// Per-process counters plus the poison-pill latch.
#[derive(Debug, Default)]
pub struct StateAccumulator {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub errors: AtomicU64,
    pub cached: AtomicU64,
    pub poisoned: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub errors: u64,
    pub cached: u64,
    pub poisoned: bool,
}

impl StateAccumulator {
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            submitted: self.submitted.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            cached: self.cached.load(Ordering::SeqCst),
            poisoned: self.poisoned.load(Ordering::SeqCst),
        }
    }
}

/// The user body of a process.
#[derive(Clone)]
pub enum ScriptBody {
    /// A shell template rendered against the firing context.
    Shell(String),
    /// An inline Rust closure; runs on the native backend.
    Native(Arc<dyn Fn(HashMap<String, DataValue>) -> Result<DataValue, String> + Send + Sync>),
}

/// Substitute `$name` / `${name}` from the context map. Unknown names stay
/// verbatim for the shell; `\$` escapes the substitution.
pub fn render_script(template: &str, context: &HashMap<String, DataValue>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'$') {
            out.push('$');
            chars.next();
            continue;
        }
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                match context.get(&name) {
                    Some(value) if closed => out.push_str(&value.render()),
                    _ => {
                        out.push_str("${");
                        out.push_str(&name);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match context.get(&name) {
                    Some(value) => out.push_str(&value.render()),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Everything a firing resolved from its input tuple.
#[derive(Debug, Default)]
pub(crate) struct ResolvedInputs {
    pub context: HashMap<String, DataValue>,
    /// Ordered `(name, value)` hash entries, declared order preserved.
    pub inputs: Vec<(String, DataValue)>,
    pub staged: Vec<FileHolder>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

/// The context value a staged file input exposes to the script: the
/// relative stored name(s), not the source path.
fn holders_value(holders: &[FileHolder]) -> DataValue {
    if holders.len() == 1 {
        DataValue::Path(PathBuf::from(&holders[0].stored_name))
    } else {
        DataValue::List(
            holders
                .iter()
                .map(|h| DataValue::Path(PathBuf::from(&h.stored_name)))
                .collect(),
        )
    }
}

struct DeferredFile {
    name: String,
    pattern: String,
    value: DataValue,
    shared: bool,
    /// Position in `inputs` reserved during the first pass.
    slot: usize,
}

pub(crate) struct ProcessorCore {
    pub name: String,
    pub session: Arc<Session>,
    pub config: ExecConfig,
    pub backend: Arc<dyn ExecutorBackend>,
    pub body: ScriptBody,
    pub outputs: Vec<OutPort>,
    /// Shared params that re-emit their final value on stop.
    pub shared_outs: Vec<(String, Sender)>,
    pub state: Arc<StateAccumulator>,
    /// Caps concurrent firings at `max_forks`.
    pub inflight: Arc<Semaphore>,
    pub await_termination: bool,
    shared_values: Mutex<HashMap<String, DataValue>>,
    shared_holders: Mutex<HashMap<String, Vec<FileHolder>>>,
    /// Submitted-but-not-finalized firings, retries included. The operator
    /// drains this to zero before forwarding the pill.
    inflight_count: AtomicU64,
    inflight_notify: tokio::sync::Notify,
    pill_sent: AtomicBool,
    next_id: AtomicU64,
}

impl ProcessorCore {
    pub fn next_task_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn begin_firing(&self) {
        self.inflight_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn end_firing(&self) {
        if self.inflight_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inflight_notify.notify_waiters();
        }
    }

    /// Wait until every submitted firing (retries included) has finalized.
    pub(crate) async fn drain_inflight(&self) {
        loop {
            let notified = self.inflight_notify.notified();
            if self.inflight_count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Map a tuple onto the declared params. Values land in the context
    /// first; file patterns expand in a second pass so they can reference
    /// earlier values. `stage_offset` numbers wildcard expansions and keeps
    /// running across merge firings.
    pub(crate) fn resolve_inputs(
        &self,
        params: &[InParam],
        tuple: &[DataValue],
        index: u64,
        stage_offset: &mut usize,
    ) -> Result<ResolvedInputs, StagingError> {
        let mut resolved = ResolvedInputs::default();
        let mut deferred = Vec::new();
        self.bind_params(params, tuple, index, &mut resolved, &mut deferred)?;

        let mut names = HashSet::new();
        for file in deferred {
            let pattern = render_script(&file.pattern, &resolved.context);
            let holders = if file.shared {
                let mut cache = self.shared_holders.lock().expect("shared lock poisoned");
                if let Some(existing) = cache.get(&file.name) {
                    existing.clone()
                } else {
                    let sources = staging::normalize(&file.value)?;
                    let holders = staging::expand(&pattern, &sources, *stage_offset)?;
                    *stage_offset += sources.len();
                    cache.insert(file.name.clone(), holders.clone());
                    holders
                }
            } else {
                let sources = staging::normalize(&file.value)?;
                let holders = staging::expand(&pattern, &sources, *stage_offset)?;
                *stage_offset += sources.len();
                holders
            };

            for holder in &holders {
                if !names.insert(holder.stored_name.clone()) {
                    return Err(StagingError::Conflict {
                        pattern,
                        name: holder.stored_name.clone(),
                    });
                }
            }

            let staged_value = holders_value(&holders);
            let hash_value = DataValue::List(
                holders
                    .iter()
                    .map(|h| DataValue::Path(h.source.clone()))
                    .collect(),
            );
            resolved.context.insert(file.name.clone(), staged_value);
            resolved.inputs[file.slot] = (file.name, hash_value);
            resolved.staged.extend(holders);
        }
        Ok(resolved)
    }

    fn bind_params(
        &self,
        params: &[InParam],
        tuple: &[DataValue],
        index: u64,
        resolved: &mut ResolvedInputs,
        deferred: &mut Vec<DeferredFile>,
    ) -> Result<(), StagingError> {
        for (param, value) in params.iter().zip(tuple) {
            self.bind_param(param, value, index, resolved, deferred)?;
        }
        Ok(())
    }

    fn bind_param(
        &self,
        param: &InParam,
        value: &DataValue,
        index: u64,
        resolved: &mut ResolvedInputs,
        deferred: &mut Vec<DeferredFile>,
    ) -> Result<(), StagingError> {
        match param {
            InParam::Value { name } | InParam::Each { name } => {
                resolved.context.insert(name.clone(), value.clone());
                resolved.inputs.push((name.clone(), value.clone()));
            }
            InParam::Env { name } => {
                resolved.env.push((name.clone(), value.render()));
                resolved.inputs.push((name.clone(), value.clone()));
            }
            InParam::Stdin => {
                resolved.stdin = Some(value.render());
                resolved.inputs.push(("stdin".to_string(), value.clone()));
            }
            InParam::File { name, pattern } => {
                resolved.inputs.push((name.clone(), DataValue::Null));
                deferred.push(DeferredFile {
                    name: name.clone(),
                    pattern: pattern.clone(),
                    value: value.clone(),
                    shared: false,
                    slot: resolved.inputs.len() - 1,
                });
            }
            InParam::Set { inner } => {
                let elements = value.iter_elements();
                if elements.len() != inner.len() {
                    return Err(StagingError::Cardinality {
                        pattern: format!("set of {}", inner.len()),
                        count: elements.len(),
                    });
                }
                self.bind_params(inner, &elements, index, resolved, deferred)?;
            }
            InParam::SharedValue { name, .. } => {
                let resolved_value = {
                    let mut shared = self.shared_values.lock().expect("shared lock poisoned");
                    if index == 1 {
                        shared.insert(name.clone(), value.clone());
                    }
                    shared.get(name).cloned().unwrap_or_else(|| value.clone())
                };
                resolved.context.insert(name.clone(), resolved_value.clone());
                resolved.inputs.push((name.clone(), resolved_value));
            }
            InParam::SharedFile { name, pattern, .. } => {
                let value = {
                    let mut shared = self.shared_values.lock().expect("shared lock poisoned");
                    if index == 1 {
                        shared.insert(name.clone(), value.clone());
                    }
                    shared.get(name).cloned().unwrap_or_else(|| value.clone())
                };
                resolved.inputs.push((name.clone(), DataValue::Null));
                deferred.push(DeferredFile {
                    name: name.clone(),
                    pattern: pattern.clone(),
                    value,
                    shared: true,
                    slot: resolved.inputs.len() - 1,
                });
            }
        }
        Ok(())
    }

    /// A work directory derived from the hash, disambiguated when a prior
    /// attempt already owns the path. Directories are never reused.
    pub(crate) fn unique_work_dir(&self, hash: &str) -> PathBuf {
        let base = self
            .session
            .work_dir
            .join(&hash[..2.min(hash.len())])
            .join(&hash[2.min(hash.len())..]);
        if !base.exists() {
            return base;
        }
        for n in 1.. {
            let candidate = base.with_file_name(format!(
                "{}_{n}",
                base.file_name().unwrap_or_default().to_string_lossy()
            ));
            if !candidate.exists() {
                return candidate;
            }
        }
        unreachable!()
    }

    pub(crate) fn hash_mode(&self) -> CacheMode {
        self.config.cache
    }

    pub(crate) fn compute_hash(&self, script: &str, inputs: &[(String, DataValue)]) -> String {
        task_hash(self.hash_mode(), &self.session.workflow_id, script, inputs)
    }

    /// Try to satisfy the firing from `store_dir`: every output must be a
    /// file declaration with a prior artifact present.
    pub(crate) fn try_store_dir(&self, task: &TaskRun) -> bool {
        let Some(store_dir) = &self.config.store_dir else {
            return false;
        };
        let all_files = self
            .outputs
            .iter()
            .all(|port| matches!(port.param, OutParam::File { .. }));
        if self.outputs.is_empty() || !all_files {
            return false;
        }
        match self.collect_values(task, store_dir) {
            Ok(values) => {
                debug!(task = %task.display_name(), dir = %store_dir.display(), "bound stored outputs");
                self.bind_values(values);
                self.state.cached.fetch_add(1, Ordering::SeqCst);
                self.session.events().emit(&TaskEvent::Cached {
                    process: self.name.clone(),
                    id: task.id,
                    name: task.display_name(),
                    hash: task.hash.clone(),
                });
                true
            }
            Err(_) => false,
        }
    }

    /// Try a cache hit: recorded success, directory still present, every
    /// declared output resolvable. Anything less rejects the hit and the
    /// task resubmits fresh.
    pub(crate) fn try_cache_hit(&self, task: &mut TaskRun) -> bool {
        if !self.config.cache.enabled() {
            return false;
        }
        let Some(record) = self.session.cache().lookup(&task.hash) else {
            return false;
        };
        if record.exit_status != 0 || !record.work_dir.is_dir() {
            debug!(task = %task.display_name(), "rejecting cache hit: bad exit or missing dir");
            return false;
        }
        match self.collect_values(task, &record.work_dir) {
            Ok(values) => {
                task.work_dir = record.work_dir.clone();
                task.exit_status = 0;
                info!(task = %task.display_name(), hash = %task.hash, "cache hit");
                self.bind_values(values);
                self.state.cached.fetch_add(1, Ordering::SeqCst);
                self.session.events().emit(&TaskEvent::Cached {
                    process: self.name.clone(),
                    id: task.id,
                    name: task.display_name(),
                    hash: task.hash.clone(),
                });
                true
            }
            Err(reason) => {
                debug!(task = %task.display_name(), %reason, "rejecting cache hit");
                false
            }
        }
    }

    /// Resolve every output declaration against `dir`.
    pub(crate) fn collect_values(
        &self,
        task: &TaskRun,
        dir: &Path,
    ) -> Result<Vec<(usize, DataValue)>, String> {
        let mut values = Vec::with_capacity(self.outputs.len());
        for (slot, port) in self.outputs.iter().enumerate() {
            values.push((slot, self.output_value(&port.param, task, dir)?));
        }
        Ok(values)
    }

    fn output_value(
        &self,
        param: &OutParam,
        task: &TaskRun,
        dir: &Path,
    ) -> Result<DataValue, String> {
        match param {
            OutParam::Value { name } => task
                .context
                .get(name)
                .cloned()
                .ok_or_else(|| format!("output value `{name}` missing from context")),
            OutParam::File { pattern } => {
                let full = dir.join(pattern).display().to_string();
                let mut matches: Vec<PathBuf> = glob::glob(&full)
                    .map_err(|err| format!("bad output pattern `{pattern}`: {err}"))?
                    .filter_map(Result::ok)
                    .collect();
                matches.sort();
                match matches.len() {
                    0 => Err(format!("missing output file `{pattern}`")),
                    1 => Ok(DataValue::Path(matches.remove(0))),
                    _ => Ok(DataValue::List(
                        matches.into_iter().map(DataValue::Path).collect(),
                    )),
                }
            }
            OutParam::Stdout => {
                if let Some(value) = &task.stdout_value {
                    return Ok(value.clone());
                }
                let out = dir.join(OUT_FILE);
                std::fs::read_to_string(&out)
                    .map(|s| DataValue::String(s.trim_end_matches('\n').to_string()))
                    .map_err(|err| format!("missing stdout capture: {err}"))
            }
            OutParam::Set { inner } => {
                let mut items = Vec::with_capacity(inner.len());
                for param in inner {
                    items.push(self.output_value(param, task, dir)?);
                }
                Ok(DataValue::List(items))
            }
        }
    }

    pub(crate) fn bind_values(&self, values: Vec<(usize, DataValue)>) {
        for (slot, value) in values {
            dataflow::bind(&self.outputs[slot].tx, value);
        }
    }

    /// Bind the resolved shared values once, before the pill goes out.
    pub(crate) fn bind_shared_outs(&self) {
        let shared = self.shared_values.lock().expect("shared lock poisoned");
        for (name, tx) in &self.shared_outs {
            if let Some(value) = shared.get(name) {
                dataflow::bind(tx, value.clone());
            }
            dataflow::close(tx);
        }
    }

    /// Forward the poison pill downstream, exactly once.
    pub(crate) fn close_outputs(&self) {
        if self.pill_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        for port in &self.outputs {
            dataflow::close(&port.tx);
        }
    }

    /// Package a task and hand it to the dispatcher.
    pub(crate) async fn submit_task(
        self: &Arc<Self>,
        task: SharedTask,
        native: Option<NativeBody>,
        await_termination: bool,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) -> Result<(), TaskError> {
        let name = {
            let task = task.lock().expect("task lock poisoned");
            task.display_name()
        };
        let handler = self
            .backend
            .create_handler(task, native)
            .await
            .map_err(|source| TaskError::Backend {
                name: name.clone(),
                source,
            })?;
        self.state.submitted.fetch_add(1, Ordering::SeqCst);
        let monitored = MonitoredTask {
            handler,
            finalizer: Arc::new(CoreFinalizer(self.clone())),
            latch: None,
            permit,
        };
        let result = self
            .session
            .dispatcher()
            .submit(
                &self.backend,
                &self.config,
                monitored,
                await_termination,
                "submitted process task",
            )
            .await;
        match result {
            // An awaited failure already went through the finalizer; the
            // caller must not route it twice.
            Err(err) if await_termination && !matches!(err, TaskError::Terminated { .. }) => {
                debug!(task = %name, %err, "awaited task failed (handled by finalizer)");
                Ok(())
            }
            other => other,
        }
    }

    /// Build the per-firing native body, when the process is native.
    pub(crate) fn native_body(&self, context: &HashMap<String, DataValue>) -> Option<NativeBody> {
        match &self.body {
            ScriptBody::Native(body) => {
                let body = body.clone();
                let context = context.clone();
                Some(Box::new(move |_| body(context)))
            }
            ScriptBody::Shell(_) => None,
        }
    }

    async fn handle_failure(self: &Arc<Self>, task: SharedTask, error: TaskError) {
        self.state.errors.fetch_add(1, Ordering::SeqCst);
        let (process, id, name) = {
            let task = task.lock().expect("task lock poisoned");
            (task.process.clone(), task.id, task.display_name())
        };
        self.session.events().emit(&TaskEvent::Failed {
            process,
            id,
            name: name.clone(),
            message: error.to_string(),
        });

        match self.config.error_strategy {
            ErrorStrategy::Ignore => {
                warn!(task = %name, %error, "task failed, ignoring");
            }
            ErrorStrategy::Retry { max_attempts } => {
                let attempt = {
                    let task = task.lock().expect("task lock poisoned");
                    task.attempt
                };
                // Staging failures are declaration problems; re-running the
                // same bytes cannot fix them.
                if matches!(error, TaskError::Staging { .. }) {
                    error!(task = %name, %error, "staging failure is not retryable, terminating");
                    self.poison(error);
                } else if attempt < max_attempts {
                    info!(task = %name, attempt = attempt + 1, "retrying failed task");
                    self.resubmit(task, attempt + 1);
                } else {
                    error!(task = %name, attempts = attempt, %error, "retry attempts exhausted");
                    self.poison(error);
                }
            }
            ErrorStrategy::Terminate => {
                error!(task = %name, %error, "task failed, terminating");
                self.poison(error);
            }
        }
    }

    fn resubmit(self: &Arc<Self>, failed: SharedTask, attempt: u32) {
        let core = self.clone();
        // Counted before the failed firing finalizes so the operator's
        // drain cannot slip between the two.
        core.begin_firing();
        tokio::spawn(async move {
            let fresh = {
                let failed = failed.lock().expect("task lock poisoned");
                let mut task = TaskRun::new(failed.process.clone(), failed.id, failed.index);
                task.attempt = attempt;
                task.script = failed.script.clone();
                task.shebang = failed.shebang.clone();
                task.context = failed.context.clone();
                task.inputs = failed.inputs.clone();
                task.staged = failed.staged.clone();
                task.aux_files = failed.aux_files.clone();
                task.embedded_staging = failed.embedded_staging;
                task.env = failed.env.clone();
                task.stdin = failed.stdin.clone();
                task.container = failed.container.clone();
                task.cluster_options = failed.cluster_options.clone();
                task.max_duration = failed.max_duration;
                task.hash = failed.hash.clone();
                task.work_dir = core.unique_work_dir(&failed.hash);
                task
            };
            let native = core.native_body(&fresh.context);
            let shared = Arc::new(Mutex::new(fresh));
            if let Err(err) = core.submit_task(shared, native, false, None).await {
                error!(%err, "retry submission failed");
                core.poison(err);
                core.end_firing();
            }
        });
    }

    /// Route a pre-submit failure (staging, validation) through the
    /// process error strategy.
    pub(crate) async fn firing_failed(self: &Arc<Self>, id: u64, index: u64, error: TaskError) {
        let task = Arc::new(Mutex::new(TaskRun::new(self.name.clone(), id, index)));
        self.handle_failure(task, error).await;
    }

    /// Terminate the process: poison the state, kill its in-flight
    /// handlers, cascade the pill downstream, abort the session.
    fn poison(&self, error: TaskError) {
        self.state.poisoned.store(true, Ordering::SeqCst);
        self.session.dispatcher().kill_process_tasks(&self.name);
        self.session.record_error(error);
        self.close_outputs();
    }
}

/// Declarative surface for wiring a process: inputs, outputs, body, and
/// per-process configuration overrides. `launch` spawns the parallel
/// operator; `launch_merge` the fold-to-single-task operator.
pub struct ProcessBuilder {
    name: String,
    inputs: Vec<InPort>,
    outputs: Vec<OutPort>,
    body: Option<ScriptBody>,
    executor: Option<String>,
    max_forks: Option<usize>,
    max_duration: Option<std::time::Duration>,
    container: Option<String>,
    cluster_options: Option<Vec<String>>,
    error_strategy: Option<ErrorStrategy>,
    store_dir: Option<PathBuf>,
    blocking: bool,
}

impl ProcessBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            body: None,
            executor: None,
            max_forks: None,
            max_duration: None,
            container: None,
            cluster_options: None,
            error_strategy: None,
            store_dir: None,
            blocking: false,
        }
    }

    pub fn input(mut self, param: InParam, source: InputSource) -> Self {
        self.inputs.push(InPort { param, source });
        self
    }

    pub fn input_value(self, name: impl Into<String>, source: InputSource) -> Self {
        self.input(InParam::Value { name: name.into() }, source)
    }

    pub fn input_file(
        self,
        name: impl Into<String>,
        pattern: impl Into<String>,
        source: InputSource,
    ) -> Self {
        self.input(
            InParam::File {
                name: name.into(),
                pattern: pattern.into(),
            },
            source,
        )
    }

    pub fn input_env(self, name: impl Into<String>, source: InputSource) -> Self {
        self.input(InParam::Env { name: name.into() }, source)
    }

    pub fn input_stdin(self, source: InputSource) -> Self {
        self.input(InParam::Stdin, source)
    }

    pub fn input_each(self, name: impl Into<String>, source: InputSource) -> Self {
        self.input(InParam::Each { name: name.into() }, source)
    }

    pub fn input_shared_value(
        self,
        name: impl Into<String>,
        source: InputSource,
        into: Option<Sender>,
    ) -> Self {
        self.input(
            InParam::SharedValue {
                name: name.into(),
                into,
            },
            source,
        )
    }

    pub fn output(mut self, param: OutParam, tx: Sender) -> Self {
        self.outputs.push(OutPort { param, tx });
        self
    }

    pub fn output_value(self, name: impl Into<String>, tx: Sender) -> Self {
        self.output(OutParam::Value { name: name.into() }, tx)
    }

    pub fn output_file(self, pattern: impl Into<String>, tx: Sender) -> Self {
        self.output(
            OutParam::File {
                pattern: pattern.into(),
            },
            tx,
        )
    }

    pub fn output_stdout(self, tx: Sender) -> Self {
        self.output(OutParam::Stdout, tx)
    }

    pub fn script(mut self, text: impl Into<String>) -> Self {
        self.body = Some(ScriptBody::Shell(text.into()));
        self
    }

    pub fn native<F>(mut self, body: F) -> Self
    where
        F: Fn(HashMap<String, DataValue>) -> Result<DataValue, String> + Send + Sync + 'static,
    {
        self.body = Some(ScriptBody::Native(Arc::new(body)));
        self
    }

    pub fn executor(mut self, name: impl Into<String>) -> Self {
        self.executor = Some(name.into());
        self
    }

    pub fn max_forks(mut self, n: usize) -> Self {
        self.max_forks = Some(n.max(1));
        self
    }

    pub fn max_duration(mut self, limit: std::time::Duration) -> Self {
        self.max_duration = Some(limit);
        self
    }

    pub fn container(mut self, image: impl Into<String>) -> Self {
        self.container = Some(image.into());
        self
    }

    pub fn cluster_options(mut self, options: Vec<String>) -> Self {
        self.cluster_options = Some(options);
        self
    }

    pub fn error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = Some(strategy);
        self
    }

    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    /// Block on each firing's completion instead of running ahead.
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Launch as a parallel processor: one task firing per input tuple.
    pub fn launch(self, session: &Arc<Session>) -> Result<ProcessHandle, ProcessError> {
        let (core, inputs) = self.build_core(session, false)?;
        let state = core.state.clone();
        let name = core.name.clone();
        let join = parallel::spawn(core, inputs);
        Ok(ProcessHandle { name, state, join })
    }

    /// Launch as a merge processor: all firings fold into one final task
    /// submitted on termination.
    pub fn launch_merge(self, session: &Arc<Session>) -> Result<ProcessHandle, ProcessError> {
        let (core, inputs) = self.build_core(session, true)?;
        let state = core.state.clone();
        let name = core.name.clone();
        let join = merge::spawn(core, inputs);
        Ok(ProcessHandle { name, state, join })
    }

    fn build_core(
        self,
        session: &Arc<Session>,
        merging: bool,
    ) -> Result<(Arc<ProcessorCore>, Vec<InPort>), ProcessError> {
        let validation = |message: &str| ProcessError::Validation {
            process: self.name.clone(),
            message: message.to_string(),
        };

        let body = self
            .body
            .clone()
            .ok_or_else(|| validation("a script or native body is required"))?;

        let mut config = session.config.clone();
        if let Some(executor) = &self.executor {
            config.executor = executor.clone();
        } else if matches!(body, ScriptBody::Native(_)) {
            config.executor = "native".to_string();
        }
        match (&body, config.executor.as_str()) {
            (ScriptBody::Native(_), executor) if executor != "native" => {
                return Err(validation("a native body requires the native executor"));
            }
            (ScriptBody::Shell(_), "native") => {
                return Err(validation("the native executor requires a native body"));
            }
            _ => {}
        }
        if merging && matches!(body, ScriptBody::Native(_)) {
            return Err(validation("merge processes require a shell body"));
        }
        if let Some(max_forks) = self.max_forks {
            config.max_forks = max_forks;
        }
        if let Some(limit) = self.max_duration {
            config.max_duration = Some(limit);
        }
        if let Some(container) = &self.container {
            config.container = Some(container.clone());
        }
        if let Some(options) = &self.cluster_options {
            config.cluster_options = options.clone();
        }
        if let Some(strategy) = self.error_strategy {
            config.error_strategy = strategy;
        }
        if let Some(dir) = &self.store_dir {
            config.store_dir = Some(dir.clone());
        }

        let has_shared = self.inputs.iter().any(|port| port.param.is_shared());
        // Shared inputs and blocking mode both serialize the process.
        let max_forks = if has_shared || self.blocking {
            1
        } else {
            config.max_forks.max(1)
        };
        let await_termination = has_shared || self.blocking;

        let backend = session.backend_for(&config)?;
        let shared_outs: Vec<(String, Sender)> = self
            .inputs
            .iter()
            .filter_map(|port| match &port.param {
                InParam::SharedValue {
                    name,
                    into: Some(tx),
                }
                | InParam::SharedFile {
                    name,
                    into: Some(tx),
                    ..
                } => Some((name.clone(), tx.clone())),
                _ => None,
            })
            .collect();

        let core = Arc::new(ProcessorCore {
            name: self.name,
            session: session.clone(),
            config,
            backend,
            body,
            outputs: self.outputs,
            shared_outs,
            state: Arc::new(StateAccumulator::default()),
            inflight: Arc::new(Semaphore::new(max_forks)),
            await_termination,
            shared_values: Mutex::new(HashMap::new()),
            shared_holders: Mutex::new(HashMap::new()),
            inflight_count: AtomicU64::new(0),
            inflight_notify: tokio::sync::Notify::new(),
            pill_sent: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        });
        Ok((core, self.inputs))
    }
}

/// A launched process: its operator task plus the live state counters.
pub struct ProcessHandle {
    name: String,
    state: Arc<StateAccumulator>,
    join: tokio::task::JoinHandle<()>,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    /// Wait for the operator to terminate (all firings finalized, pill
    /// forwarded) and return the final counters.
    pub async fn join(self) -> StateSnapshot {
        if let Err(err) = self.join.await {
            error!(process = %self.name, ?err, "process operator panicked");
        }
        self.state.snapshot()
    }
}

/// Bridges the monitor's completion callback onto the processor core.
pub(crate) struct CoreFinalizer(pub(crate) Arc<ProcessorCore>);

#[async_trait]
impl TaskFinalizer for CoreFinalizer {
    async fn finalize(&self, task: SharedTask, outcome: Result<(), TaskError>) {
        self.finalize_inner(task, outcome).await;
        self.0.end_firing();
    }
}

impl CoreFinalizer {
    async fn finalize_inner(&self, task: SharedTask, outcome: Result<(), TaskError>) {
        let core = &self.0;
        let outcome: Result<(), TaskError> = match outcome {
            Ok(()) => {
                // Collect and bind while the task lock is held; nothing
                // here awaits.
                let collected = {
                    let task = task.lock().expect("task lock poisoned");
                    core.collect_values(&task, &task.work_dir).map(|values| {
                        (
                            values,
                            task.hash.clone(),
                            task.work_dir.clone(),
                            task.exit_status,
                            task.id,
                            task.display_name(),
                        )
                    })
                };
                match collected {
                    Ok((values, hash, work_dir, exit_status, id, name)) => {
                        core.bind_values(values);
                        core.state.completed.fetch_add(1, Ordering::SeqCst);
                        if core.config.cache.enabled() && !hash.is_empty() {
                            core.session.cache().record(CacheRecord {
                                hash,
                                work_dir,
                                exit_status,
                            });
                        }
                        debug!(task = %name, exit_status, "task completed");
                        core.session.events().emit(&TaskEvent::Completed {
                            process: core.name.clone(),
                            id,
                            name,
                            exit_status,
                        });
                        // A freed slot may unblock queued admissions.
                        core.session
                            .dispatcher()
                            .signal_complete(core.backend.name());
                        return;
                    }
                    Err(reason) => {
                        let (id, name) = {
                            let task = task.lock().expect("task lock poisoned");
                            (task.id, task.display_name())
                        };
                        Err(TaskError::Failed {
                            name,
                            id,
                            message: reason,
                        })
                    }
                }
            }
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            core.handle_failure(task, err).await;
        }
    }
}
