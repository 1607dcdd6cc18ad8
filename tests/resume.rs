//! Hash-based resume scenarios.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use weir::dataflow::Receiver;
use weir::{
    channel, DataValue, ExecConfig, InputSource, Message, ProcessBuilder, Session, TaskEvent,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn config(resume: bool) -> ExecConfig {
    let mut config = ExecConfig::default();
    config.poll_interval = Duration::from_millis(10);
    config.resume = resume;
    config
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

async fn run_once(dir: &TempDir, resume: bool) -> (Vec<DataValue>, Vec<TaskEvent>) {
    let session = Session::new("resume-wf", dir.path().join("work"), config(resume)).unwrap();
    let events = collect_events(&session);
    let (out_tx, mut out_rx) = channel();

    let handle = ProcessBuilder::new("produce")
        .input_value("x", InputSource::Singleton(DataValue::from("ok")))
        .output_file("out.txt", out_tx)
        .script("printf ok > out.txt")
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    handle.join().await;
    session.shutdown().await;

    let events = events.lock().unwrap().clone();
    (values, events)
}

#[tokio::test]
async fn resume_rebinds_outputs_without_submission() {
    let dir = TempDir::new().unwrap();

    let (first_values, first_events) = run_once(&dir, false).await;
    assert_eq!(first_values.len(), 1);
    assert!(first_events
        .iter()
        .any(|e| matches!(e, TaskEvent::Submitted { .. })));

    let (second_values, second_events) = run_once(&dir, true).await;
    // Identical bound outputs, no backend submission, the cache event fires.
    assert_eq!(second_values, first_values);
    assert!(!second_events
        .iter()
        .any(|e| matches!(e, TaskEvent::Submitted { .. })));
    assert!(second_events
        .iter()
        .any(|e| matches!(e, TaskEvent::Cached { .. })));

    let out = first_values[0].as_path().unwrap();
    assert_eq!(fs::read_to_string(out).unwrap(), "ok");
}

#[tokio::test]
async fn changed_script_misses_the_cache() {
    let dir = TempDir::new().unwrap();
    let (_, first_events) = run_once(&dir, false).await;
    assert_eq!(
        first_events
            .iter()
            .filter(|e| matches!(e, TaskEvent::Submitted { .. }))
            .count(),
        1
    );

    // Same inputs, different script text: must resubmit even on resume.
    let session = Session::new("resume-wf", dir.path().join("work"), config(true)).unwrap();
    let events = collect_events(&session);
    let (out_tx, mut out_rx) = channel();
    let handle = ProcessBuilder::new("produce")
        .input_value("x", InputSource::Singleton(DataValue::from("ok")))
        .output_file("out.txt", out_tx)
        .script("printf changed > out.txt")
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert_eq!(values.len(), 1);
    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, TaskEvent::Submitted { .. })));
    handle.join().await;
    session.shutdown().await;
}

#[tokio::test]
async fn missing_cached_output_rejects_the_hit() {
    let dir = TempDir::new().unwrap();
    let (first_values, _) = run_once(&dir, false).await;

    // Delete the produced artifact; the recorded hit is no longer valid.
    let out = first_values[0].as_path().unwrap();
    fs::remove_file(&out).unwrap();

    let (second_values, second_events) = run_once(&dir, true).await;
    assert_eq!(second_values.len(), 1);
    assert!(second_events
        .iter()
        .any(|e| matches!(e, TaskEvent::Submitted { .. })));
    assert!(!second_events
        .iter()
        .any(|e| matches!(e, TaskEvent::Cached { .. })));
}
