//! End-to-end scenarios on the local backend.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::time::timeout;

use weir::dataflow::{self, Receiver};
use weir::executor::{ExecutorBackend, LocalExecutor};
use weir::handler::TaskHandler;
use weir::{
    channel, DataValue, ErrorStrategy, ExecConfig, InputSource, Message, ProcessBuilder, Session,
    TaskEvent, TaskRun,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn test_config() -> ExecConfig {
    let mut config = ExecConfig::default();
    config.poll_interval = Duration::from_millis(10);
    config
}

fn session_in(dir: &TempDir) -> Arc<Session> {
    Session::new("test-wf", dir.path().join("work"), test_config()).unwrap()
}

fn collect_events(session: &Arc<Session>) -> Arc<Mutex<Vec<TaskEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.on_event(Box::new(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    }));
    events
}

async fn drain(rx: &mut Receiver) -> Vec<DataValue> {
    let mut out = Vec::new();
    while let Some(message) = rx.recv().await {
        match message {
            Message::Item(value) => out.push(value),
            Message::PoisonPill => break,
        }
    }
    out
}

/// Task work dirs under the session work dir, skipping engine metadata.
fn task_dirs(work: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for shard in fs::read_dir(work).unwrap().filter_map(Result::ok) {
        if shard.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        for task in fs::read_dir(shard.path()).unwrap().filter_map(Result::ok) {
            dirs.push(task.path());
        }
    }
    dirs
}

#[tokio::test]
async fn single_value_task_binds_stdout() {
    let dir = TempDir::new().unwrap();
    let session = session_in(&dir);
    let (out_tx, mut out_rx) = channel();

    let handle = ProcessBuilder::new("hello")
        .input_value("x", InputSource::Singleton(DataValue::Int(42)))
        .output_stdout(out_tx)
        .script("echo $x")
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert_eq!(values, vec![DataValue::String("42".into())]);

    let state = handle.join().await;
    assert_eq!(state.submitted, 1);
    assert_eq!(state.completed, 1);
    assert_eq!(state.errors, 0);

    let dirs = task_dirs(&session.work_dir);
    assert_eq!(dirs.len(), 1);
    let out = fs::read_to_string(dirs[0].join(".command.out")).unwrap();
    assert!(out.starts_with("42\n"));
    let exit = fs::read_to_string(dirs[0].join(".exitcode")).unwrap();
    assert_eq!(exit.trim(), "0");

    session.shutdown().await;
}

#[tokio::test]
async fn two_stage_pipeline_propagates_pill() {
    let dir = TempDir::new().unwrap();
    let session = session_in(&dir);
    let (mid_tx, mid_rx) = channel();
    let (out_tx, mut out_rx) = channel();

    let first = ProcessBuilder::new("emit")
        .input_value("x", InputSource::Singleton(DataValue::from("hello")))
        .output_stdout(mid_tx)
        .script("echo $x")
        .launch(&session)
        .unwrap();
    let second = ProcessBuilder::new("consume")
        .input_value("msg", InputSource::Queue(mid_rx))
        .output_stdout(out_tx)
        .script("echo got:$msg")
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert_eq!(values, vec![DataValue::String("got:hello".into())]);

    first.join().await;
    let state = second.join().await;
    assert_eq!(state.completed, 1);
    session.shutdown().await;
}

#[tokio::test]
async fn env_and_stdin_reach_the_command() {
    let dir = TempDir::new().unwrap();
    let session = session_in(&dir);
    let (out_tx, mut out_rx) = channel();

    ProcessBuilder::new("plumbing")
        .input_env("GREETING", InputSource::Singleton(DataValue::from("hi")))
        .input_stdin(InputSource::Singleton(DataValue::from("payload\n")))
        .output_stdout(out_tx)
        .script("cat -\necho $GREETING")
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert_eq!(values, vec![DataValue::String("payload\nhi".into())]);
    session.shutdown().await;
}

#[tokio::test]
async fn file_input_stages_under_pattern_name() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("reads.fastq");
    fs::write(&input, "ACGT\n").unwrap();

    let session = session_in(&dir);
    let (out_tx, mut out_rx) = channel();

    ProcessBuilder::new("stage")
        .input_file(
            "reads",
            "*.fq",
            InputSource::Singleton(DataValue::Path(input)),
        )
        .output_stdout(out_tx)
        .script("cat $reads")
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert_eq!(values, vec![DataValue::String("ACGT".into())]);

    let dirs = task_dirs(&session.work_dir);
    assert!(dirs[0].join("file1.fq").exists());
    session.shutdown().await;
}

#[tokio::test]
async fn walltime_overflow_forces_completion() {
    let dir = TempDir::new().unwrap();
    let session = session_in(&dir);
    let events = collect_events(&session);
    let (out_tx, mut out_rx) = channel();

    let started = Instant::now();
    let handle = ProcessBuilder::new("sleepy")
        .input_value("x", InputSource::Singleton(DataValue::Int(1)))
        .output_stdout(out_tx)
        .script("sleep 5")
        .max_duration(Duration::from_millis(50))
        .error_strategy(ErrorStrategy::Ignore)
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert!(values.is_empty());

    let state = handle.join().await;
    assert_eq!(state.errors, 1);
    assert!(started.elapsed() < Duration::from_secs(4));

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        TaskEvent::Failed { message, .. } if message.contains("max duration")
    )));
    session.shutdown().await;
}

#[tokio::test]
async fn saturated_monitor_makes_progress() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.queue_size = 1;
    let session = Session::new("test-wf", dir.path().join("work"), config).unwrap();
    let (in_tx, in_rx) = channel();
    let (out_tx, mut out_rx) = channel();

    for n in 0..3 {
        dataflow::bind(&in_tx, DataValue::Int(n));
    }
    dataflow::close(&in_tx);

    let handle = ProcessBuilder::new("burst")
        .input_value("n", InputSource::Queue(in_rx))
        .output_stdout(out_tx)
        .script("sleep 0.1; echo $n")
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert_eq!(values.len(), 3);
    let state = handle.join().await;
    assert_eq!(state.submitted, 3);
    assert_eq!(state.completed, 3);
    session.shutdown().await;
}

#[tokio::test]
async fn native_body_runs_without_a_shell() {
    let dir = TempDir::new().unwrap();
    let session = session_in(&dir);
    let (out_tx, mut out_rx) = channel();

    ProcessBuilder::new("double")
        .input_value("x", InputSource::Singleton(DataValue::Int(21)))
        .output_stdout(out_tx)
        .native(|context| match context.get("x") {
            Some(DataValue::Int(x)) => Ok(DataValue::Int(x * 2)),
            other => Err(format!("unexpected input: {other:?}")),
        })
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert_eq!(values, vec![DataValue::Int(42)]);
    session.shutdown().await;
}

#[tokio::test]
async fn retry_strategy_resubmits_failed_firings() {
    let dir = TempDir::new().unwrap();
    let session = session_in(&dir);
    let (out_tx, mut out_rx) = channel();

    // Fails on the first attempt, succeeds once the marker exists.
    let marker = dir.path().join("attempted");
    let script = format!(
        "if [ -f {0} ]; then echo ok; else touch {0}; exit 1; fi",
        marker.display()
    );

    let handle = ProcessBuilder::new("flaky")
        .input_value("x", InputSource::Singleton(DataValue::Int(1)))
        .output_stdout(out_tx)
        .script(script)
        .error_strategy(ErrorStrategy::Retry { max_attempts: 3 })
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert_eq!(values, vec![DataValue::String("ok".into())]);

    let state = handle.join().await;
    assert_eq!(state.errors, 1);
    assert_eq!(state.completed, 1);
    assert!(!state.poisoned);
    assert!(session.take_first_error().is_none());
    session.shutdown().await;
}

#[tokio::test]
async fn terminate_strategy_poisons_the_process() {
    let dir = TempDir::new().unwrap();
    let session = session_in(&dir);
    let (out_tx, mut out_rx) = channel();

    let handle = ProcessBuilder::new("doomed")
        .input_value("x", InputSource::Singleton(DataValue::Int(1)))
        .output_stdout(out_tx)
        .script("exit 3")
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert!(values.is_empty());

    let state = handle.join().await;
    assert!(state.poisoned);
    assert!(session.is_aborted());
    let error = session.take_first_error().unwrap();
    assert!(error.to_string().contains("status 3"));
    session.shutdown().await;
}

#[tokio::test]
async fn completed_handler_checks_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut task = TaskRun::new("direct", 1, 1);
    task.work_dir = dir.path().join("task");
    task.script = "echo done".into();

    let backend = LocalExecutor::new();
    let shared = Arc::new(Mutex::new(task));
    let mut handler = backend.create_handler(shared, None).await.unwrap();

    handler.submit().await.unwrap();
    assert!(handler.check_if_running().await.unwrap());
    assert!(!handler.check_if_running().await.unwrap());

    let completed = timeout(TEST_TIMEOUT, async {
        loop {
            if handler.check_if_completed().await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(completed.is_ok());

    // Past Completed the check is a no-op.
    assert!(!handler.check_if_completed().await.unwrap());
    assert!(!handler.check_if_completed().await.unwrap());

    let task = handler.task().lock().unwrap();
    assert_eq!(task.exit_status, 0);
    assert!(task.exit_file().exists());
    assert!(task.stdout_path.as_ref().unwrap().starts_with(&task.work_dir));
}
