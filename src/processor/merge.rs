//! The fold-to-single-task operator.
//!
//! Every incoming tuple is resolved like a parallel firing, but instead of
//! submitting, the rendered command is appended to a running script buffer
//! as its own section, the firing's files join a shared staging set, and a
//! per-firing sub-hash is recorded. The poison pill folds the sorted
//! sub-hashes into one merge hash and submits a single final task.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::parallel::TupleStream;
use super::{render_script, ProcessorCore, ResolvedInputs, ScriptBody};
use crate::error::{StagingError, TaskError};
use crate::hash::merge_hash;
use crate::params::InPort;
use crate::staging::{self, FileHolder};
use crate::task::TaskRun;
use crate::trie::PathTrie;
use crate::value::DataValue;
use crate::wrapper;

pub(crate) fn spawn(core: Arc<ProcessorCore>, inputs: Vec<InPort>) -> JoinHandle<()> {
    tokio::spawn(run(core, inputs))
}

#[derive(Default)]
struct MergeState {
    sections: Vec<String>,
    holders: Vec<FileHolder>,
    stored_names: HashSet<String>,
    aux_files: Vec<(String, String)>,
    sub_hashes: Vec<String>,
    context: std::collections::HashMap<String, DataValue>,
    count: u64,
}

async fn run(core: Arc<ProcessorCore>, inputs: Vec<InPort>) {
    let mut params = Vec::with_capacity(inputs.len());
    let mut sources = Vec::with_capacity(inputs.len());
    for port in inputs {
        params.push(port.param);
        sources.push(port.source);
    }
    let mut stream = TupleStream::wire(&params, sources);

    let mut state = MergeState::default();
    let mut stage_offset = 1usize;
    let mut index = 0u64;

    while let Some(tuple) = stream.next().await {
        if core.state.poisoned.load(Ordering::SeqCst) || core.session.is_aborted() {
            break;
        }
        index += 1;
        let resolved = match core.resolve_inputs(&params, &tuple, index, &mut stage_offset) {
            Ok(resolved) => resolved,
            Err(source) => {
                let name = format!("{} ({index})", core.name);
                core.firing_failed(index, index, TaskError::Staging { name, source })
                    .await;
                continue;
            }
        };
        if let Err(source) = collect_firing(&core, &mut state, resolved, index) {
            let name = format!("{} ({index})", core.name);
            core.firing_failed(index, index, TaskError::Staging { name, source })
                .await;
        }
    }

    if core.state.poisoned.load(Ordering::SeqCst) {
        core.close_outputs();
        return;
    }
    if state.count == 0 {
        warn!(process = %core.name, "merge received no firings, nothing to submit");
        core.close_outputs();
        return;
    }
    submit_merged(&core, state).await;
    core.close_outputs();
    debug!(process = %core.name, state = ?core.state.snapshot(), "merge process stopped");
}

/// Fold one firing into the accumulator.
fn collect_firing(
    core: &Arc<ProcessorCore>,
    state: &mut MergeState,
    resolved: ResolvedInputs,
    index: u64,
) -> Result<(), StagingError> {
    staging::check_sources(&resolved.staged)?;
    for holder in &resolved.staged {
        if !state.stored_names.insert(holder.stored_name.clone()) {
            return Err(StagingError::Conflict {
                pattern: holder.stored_name.clone(),
                name: holder.stored_name.clone(),
            });
        }
    }

    let template = match &core.body {
        ScriptBody::Shell(template) => template,
        // Validated away at launch.
        ScriptBody::Native(_) => unreachable!("merge bodies are shell scripts"),
    };
    let rendered = render_script(template, &resolved.context);
    let (shebang, body) = wrapper::split_shebang(&rendered);
    let sub_hash = core.compute_hash(&rendered, &resolved.inputs);

    let command_file = format!(".command.sh.{index}");
    let interpreter = shebang.unwrap_or_else(|| "/bin/bash".to_string());
    let mut section = format!("# section {index}: {}\n", core.name);
    section.push_str(&wrapper::stage_in_lines(&resolved.staged));

    let stdin_redirect = match &resolved.stdin {
        Some(text) => {
            let stdin_file = format!(".command.in.{index}");
            state.aux_files.push((stdin_file.clone(), text.clone()));
            format!(" < {stdin_file}")
        }
        None => String::new(),
    };

    match &core.config.container {
        Some(image) => {
            let env_file = format!(".command.env.{index}");
            state
                .aux_files
                .push((env_file.clone(), wrapper::env_file_body(&resolved.env)));
            let mut trie = PathTrie::new();
            for holder in &resolved.staged {
                trie.add(&holder.source);
            }
            let mut line = format!("docker run -i --rm --env-file {env_file}");
            for mount in trie.mount_points() {
                line.push_str(&format!(" -v \"{0}\":\"{0}\"", mount.display()));
            }
            line.push_str(&format!(
                " -v \"$PWD\":\"$PWD\" -w \"$PWD\" {image} {interpreter} {command_file}{stdin_redirect}\n"
            ));
            section.push_str(&line);
        }
        None => {
            section.push_str(&wrapper::env_exports(&resolved.env));
            section.push_str(&format!("{interpreter} {command_file}{stdin_redirect}\n"));
        }
    }

    state.aux_files.push((command_file, body));
    state.sections.push(section);
    state.holders.extend(resolved.staged);
    state.context.extend(resolved.context);
    state.sub_hashes.push(sub_hash);
    state.count += 1;
    Ok(())
}

async fn submit_merged(core: &Arc<ProcessorCore>, state: MergeState) {
    let id = core.next_task_id();
    let mut task = TaskRun::new(core.name.clone(), id, 1);
    task.script = state.sections.join("\n");
    task.embedded_staging = true;
    task.staged = state.holders;
    task.aux_files = state.aux_files;
    task.context = state.context;
    task.cluster_options = core.config.cluster_options.clone();
    task.max_duration = core.config.max_duration;
    task.hash = merge_hash(&core.session.workflow_id, &state.sub_hashes);

    if core.try_store_dir(&task) {
        return;
    }
    if core.try_cache_hit(&mut task) {
        return;
    }
    task.work_dir = core.unique_work_dir(&task.hash);

    let shared = Arc::new(Mutex::new(task));
    // One final task: block until the finalizer has bound the outputs so
    // the pill goes out after them.
    core.begin_firing();
    if let Err(err) = core.submit_task(shared.clone(), None, true, None).await {
        core.handle_failure(shared, err).await;
        core.end_firing();
    }
}
