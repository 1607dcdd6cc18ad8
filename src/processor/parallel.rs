//! The per-message firing operator.
//!
//! Reads one tuple per firing from its input ports, materializes a task,
//! and hands it to the dispatcher. When any input is declared `each`, an
//! upstream fan-out operator is spliced in that expands the cartesian
//! product of the iterated positions, so the main operator always sees one
//! value per position.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{render_script, ProcessorCore, ScriptBody};
use crate::dataflow::{self, InputSource};
use crate::error::TaskError;
use crate::params::{InParam, InPort};
use crate::staging;
use crate::task::TaskRun;
use crate::value::DataValue;
use crate::wrapper;

const STAGING_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(250);

pub(crate) fn spawn(core: Arc<ProcessorCore>, inputs: Vec<InPort>) -> JoinHandle<()> {
    tokio::spawn(run(core, inputs))
}

pub(crate) enum TupleStream {
    Direct {
        sources: Vec<InputSource>,
        only_singletons: bool,
        fired: bool,
    },
    Fanned(mpsc::UnboundedReceiver<Vec<DataValue>>),
}

impl TupleStream {
    /// Splice in the `each` fan-out operator when any position iterates;
    /// otherwise read tuples straight off the ports.
    pub(crate) fn wire(params: &[InParam], sources: Vec<InputSource>) -> Self {
        if params.iter().any(InParam::is_each) {
            let positions: Vec<usize> = params
                .iter()
                .enumerate()
                .filter(|(_, p)| p.is_each())
                .map(|(i, _)| i)
                .collect();
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(fan_out(sources, positions, tx));
            TupleStream::Fanned(rx)
        } else {
            let only_singletons = sources.iter().all(InputSource::is_singleton);
            TupleStream::Direct {
                sources,
                only_singletons,
                fired: false,
            }
        }
    }

    pub(crate) async fn next(&mut self) -> Option<Vec<DataValue>> {
        match self {
            TupleStream::Direct {
                sources,
                only_singletons,
                fired,
            } => {
                // An all-singleton process fires exactly once.
                if *only_singletons {
                    if *fired {
                        return None;
                    }
                    *fired = true;
                }
                dataflow::read_tuple(sources).await
            }
            TupleStream::Fanned(rx) => rx.recv().await,
        }
    }
}

async fn run(core: Arc<ProcessorCore>, inputs: Vec<InPort>) {
    let mut params = Vec::with_capacity(inputs.len());
    let mut sources = Vec::with_capacity(inputs.len());
    for port in inputs {
        params.push(port.param);
        sources.push(port.source);
    }

    let mut stream = TupleStream::wire(&params, sources);

    let mut index = 0u64;
    while let Some(tuple) = stream.next().await {
        if core.state.poisoned.load(Ordering::SeqCst) || core.session.is_aborted() {
            break;
        }
        index += 1;
        fire(&core, &params, tuple, index).await;
    }

    // Poison pill: wait for every firing submitted before the pill
    // (retries included), bind shared values, then forward the pill.
    core.drain_inflight().await;
    core.bind_shared_outs();
    core.close_outputs();
    debug!(process = %core.name, state = ?core.state.snapshot(), "process stopped");
}

/// Upstream cartesian fan-out for `each` inputs. Runs serially (a single
/// task), preserving declared combination order.
async fn fan_out(
    mut sources: Vec<InputSource>,
    positions: Vec<usize>,
    tx: mpsc::UnboundedSender<Vec<DataValue>>,
) {
    while let Some(tuple) = dataflow::read_tuple(&mut sources).await {
        let axes: Vec<Vec<DataValue>> = positions
            .iter()
            .map(|&i| tuple[i].iter_elements())
            .collect();
        // An empty iteration axis means zero combinations.
        if axes.iter().any(Vec::is_empty) {
            if sources.iter().all(InputSource::is_singleton) {
                break;
            }
            continue;
        }
        let mut combo = vec![0usize; axes.len()];
        'emit: loop {
            let mut expanded = tuple.clone();
            for (axis, &choice) in combo.iter().enumerate() {
                expanded[positions[axis]] = axes[axis][choice].clone();
            }
            if tx.send(expanded).is_err() {
                return;
            }
            // Odometer increment, last axis fastest.
            for axis in (0..combo.len()).rev() {
                combo[axis] += 1;
                if combo[axis] < axes[axis].len() {
                    continue 'emit;
                }
                combo[axis] = 0;
            }
            break;
        }
        if sources.iter().all(InputSource::is_singleton) {
            break;
        }
    }
}

async fn fire(core: &Arc<ProcessorCore>, params: &[InParam], tuple: Vec<DataValue>, index: u64) {
    let id = core.next_task_id();
    let mut stage_offset = 1usize;

    let resolved = match core.resolve_inputs(params, &tuple, index, &mut stage_offset) {
        Ok(resolved) => resolved,
        Err(source) => {
            let name = format!("{} ({index})", core.name);
            core.firing_failed(id, index, TaskError::Staging { name, source })
                .await;
            return;
        }
    };

    let (shebang, script) = match &core.body {
        ScriptBody::Shell(template) => {
            let rendered = render_script(template, &resolved.context);
            wrapper::split_shebang(&rendered)
        }
        ScriptBody::Native(_) => (None, String::new()),
    };

    let mut task = TaskRun::new(core.name.clone(), id, index);
    task.script = script;
    task.shebang = shebang;
    task.context = resolved.context;
    task.inputs = resolved.inputs;
    task.staged = resolved.staged;
    task.env = resolved.env;
    task.stdin = resolved.stdin;
    task.container = core.config.container.clone();
    task.cluster_options = core.config.cluster_options.clone();
    task.max_duration = core.config.max_duration;

    if core.try_store_dir(&task) {
        return;
    }

    // Missing inputs fail the firing before submit; network paths get a
    // few re-checks before giving up.
    let mut staging_attempts = 0;
    while let Err(source) = staging::check_sources(&task.staged) {
        if source.is_retryable() && staging_attempts < 3 {
            staging_attempts += 1;
            warn!(task = %task.display_name(), %source, "input not reachable yet, retrying");
            sleep(STAGING_RETRY_DELAY).await;
            continue;
        }
        let name = task.display_name();
        core.firing_failed(id, index, TaskError::Staging { name, source })
            .await;
        return;
    }

    task.hash = core.compute_hash(&task.script, &task.inputs);
    if core.try_cache_hit(&mut task) {
        return;
    }
    task.work_dir = core.unique_work_dir(&task.hash);

    let permit = match core.inflight.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    let native = core.native_body(&task.context);
    let shared = Arc::new(Mutex::new(task));
    core.begin_firing();
    if let Err(err) = core
        .submit_task(shared.clone(), native, core.await_termination, Some(permit))
        .await
    {
        // Pre-monitor failure: the finalizer never ran for this firing.
        core.handle_failure(shared, err).await;
        core.end_firing();
    }
}

