//! `each` fan-out and merge-fold scenarios.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use weir::dataflow::{self, Receiver};
use weir::{
    channel, merge_hash, task_hash, CacheMode, DataValue, ExecConfig, InputSource, Message,
    ProcessBuilder, Session, TaskEvent,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn test_config() -> ExecConfig {
    let mut config = ExecConfig::default();
    config.poll_interval = Duration::from_millis(10);
    config
}

fn session_in(dir: &TempDir, workflow: &str) -> Arc<Session> {
    Session::new(workflow, dir.path().join("work"), test_config()).unwrap()
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

fn submitted_hashes(events: &Arc<Mutex<Vec<TaskEvent>>>) -> Vec<String> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            TaskEvent::Submitted { hash, .. } => Some(hash.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn each_inputs_fan_out_the_cartesian_product() {
    let dir = TempDir::new().unwrap();
    let session = session_in(&dir, "fanout-wf");
    let events = collect_events(&session);
    let (out_tx, mut out_rx) = channel();

    let handle = ProcessBuilder::new("combos")
        .input_each(
            "a",
            InputSource::Singleton(DataValue::List(vec![
                DataValue::Int(1),
                DataValue::Int(2),
            ])),
        )
        .input_each(
            "b",
            InputSource::Singleton(DataValue::List(vec![
                DataValue::from("x"),
                DataValue::from("y"),
            ])),
        )
        .input_value("c", InputSource::Singleton(DataValue::Int(9)))
        .output_stdout(out_tx)
        .script("echo ${a}${b}${c}")
        .max_forks(1)
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    let expected: Vec<DataValue> = ["1x9", "1y9", "2x9", "2y9"]
        .iter()
        .map(|s| DataValue::String(s.to_string()))
        .collect();
    assert_eq!(values, expected);

    let state = handle.join().await;
    assert_eq!(state.submitted, 4);
    assert_eq!(state.completed, 4);

    // Four distinct firings, four distinct hashes.
    let hashes = submitted_hashes(&events);
    assert_eq!(hashes.len(), 4);
    let unique: std::collections::HashSet<&String> = hashes.iter().collect();
    assert_eq!(unique.len(), 4);

    session.shutdown().await;
}

#[tokio::test]
async fn merge_folds_all_firings_into_one_task() {
    let dir = TempDir::new().unwrap();
    let f1 = dir.path().join("one.txt");
    let f2 = dir.path().join("two.txt");
    fs::write(&f1, "AAA\n").unwrap();
    fs::write(&f2, "BBB\n").unwrap();

    let session = session_in(&dir, "merge-wf");
    let events = collect_events(&session);
    let (in_tx, in_rx) = channel();
    let (out_tx, mut out_rx) = channel();

    dataflow::bind(&in_tx, DataValue::Path(f1.clone()));
    dataflow::bind(&in_tx, DataValue::Path(f2.clone()));
    dataflow::close(&in_tx);

    let handle = ProcessBuilder::new("gather")
        .input_file("f", "*", InputSource::Queue(in_rx))
        .output_stdout(out_tx)
        .script("cat $f")
        .launch_merge(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert_eq!(values, vec![DataValue::String("AAA\nBBB".into())]);

    let state = handle.join().await;
    assert_eq!(state.submitted, 1);
    assert_eq!(state.completed, 1);

    // One submission whose hash folds the sorted per-firing sub-hashes.
    let hashes = submitted_hashes(&events);
    assert_eq!(hashes.len(), 1);
    let sub1 = task_hash(
        CacheMode::Standard,
        "merge-wf",
        "cat file1",
        &[(
            "f".to_string(),
            DataValue::List(vec![DataValue::Path(f1.clone())]),
        )],
    );
    let sub2 = task_hash(
        CacheMode::Standard,
        "merge-wf",
        "cat file2",
        &[(
            "f".to_string(),
            DataValue::List(vec![DataValue::Path(f2.clone())]),
        )],
    );
    assert_eq!(hashes[0], merge_hash("merge-wf", &[sub1, sub2]));

    // The wrapper carries one section per firing and stages both inputs
    // under distinct names.
    let work_dir: PathBuf = session
        .work_dir
        .join(&hashes[0][..2])
        .join(&hashes[0][2..]);
    let wrapper = fs::read_to_string(work_dir.join(".command.sh")).unwrap();
    assert!(wrapper.contains("# section 1"));
    assert!(wrapper.contains("# section 2"));
    assert!(wrapper.contains(&format!("ln -s \"{}\" \"file1\"", f1.display())));
    assert!(wrapper.contains(&format!("ln -s \"{}\" \"file2\"", f2.display())));
    assert!(work_dir.join(".command.sh.1").exists());
    assert!(work_dir.join(".command.sh.2").exists());

    session.shutdown().await;
}

#[tokio::test]
async fn zero_firing_merge_submits_nothing() {
    let dir = TempDir::new().unwrap();
    let session = session_in(&dir, "empty-merge-wf");
    let events = collect_events(&session);
    let (in_tx, in_rx) = channel();
    let (out_tx, mut out_rx) = channel();

    dataflow::close(&in_tx);

    let handle = ProcessBuilder::new("gather")
        .input_file("f", "*", InputSource::Queue(in_rx))
        .output_stdout(out_tx)
        .script("cat $f")
        .launch_merge(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    assert!(values.is_empty());
    let state = handle.join().await;
    assert_eq!(state.submitted, 0);
    assert!(submitted_hashes(&events).is_empty());
    session.shutdown().await;
}

#[tokio::test]
async fn shared_input_resolves_once_across_firings() {
    let dir = TempDir::new().unwrap();
    let session = session_in(&dir, "shared-wf");
    let (in_tx, in_rx) = channel();
    let (out_tx, mut out_rx) = channel();
    let (shared_out_tx, mut shared_out_rx) = channel();

    for n in [7i64, 8, 9] {
        dataflow::bind(&in_tx, DataValue::Int(n));
    }
    dataflow::close(&in_tx);

    let handle = ProcessBuilder::new("pinned")
        .input_shared_value("s", InputSource::Queue(in_rx), Some(shared_out_tx))
        .output_stdout(out_tx)
        .script("echo $s")
        .launch(&session)
        .unwrap();

    let values = timeout(TEST_TIMEOUT, drain(&mut out_rx)).await.unwrap();
    // Firing 1 pins the value; later firings reuse it.
    assert_eq!(
        values,
        vec![
            DataValue::String("7".into()),
            DataValue::String("7".into()),
            DataValue::String("7".into()),
        ]
    );

    // The shared channel sees the final value once, before its pill.
    let shared = timeout(TEST_TIMEOUT, drain(&mut shared_out_rx))
        .await
        .unwrap();
    assert_eq!(shared, vec![DataValue::Int(7)]);

    let state = handle.join().await;
    assert_eq!(state.submitted, 3);
    assert_eq!(state.completed, 3);
    session.shutdown().await;
}
