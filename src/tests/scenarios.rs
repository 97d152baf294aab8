// src/tests/scenarios.rs
//
// Each test exercises one of the concrete scenarios against the in-memory
// `MockClient`: no network, no real database, fully deterministic except
// where noted (scenario 5's reconnect race is worked around with a retry
// loop, not a fixed sleep).

use std::sync::{Arc, Mutex};

use crate::client::mock::{MockClient, Scripted};
use crate::client::CallResponse;
use crate::loader::BulkLoaderBuilder;
use crate::manager::IngestManager;
use crate::metrics::IngestMetrics;
use crate::router::{HashPartitioner, PartitionRouter};
use crate::value::{ColumnType, Value};

fn test_manager(client: Arc<MockClient>, partition_count: usize) -> Arc<IngestManager> {
    let metrics = Arc::new(IngestMetrics::new().unwrap());
    let router = Arc::new(PartitionRouter::new(Arc::new(HashPartitioner)));
    IngestManager::new(client, metrics, router, partition_count, 5)
}

#[derive(Default)]
struct Recorder {
    successes: Mutex<Vec<(u64, CallResponse)>>,
    failures: Mutex<Vec<(u64, Vec<Value>, CallResponse)>>,
}

impl Recorder {
    fn on_success(self: &Arc<Self>) -> impl Fn(u64, CallResponse) + Send + Sync + 'static {
        let this = self.clone();
        move |handle, response| this.successes.lock().unwrap().push((handle, response))
    }

    fn on_failure(self: &Arc<Self>) -> impl Fn(u64, Vec<Value>, CallResponse) + Send + Sync + 'static {
        let this = self.clone();
        move |handle, values, response| this.failures.lock().unwrap().push((handle, values, response))
    }
}

/// Scenario 1: happy path on an MP table.
#[tokio::test]
async fn happy_path_mp_table() {
    let client = Arc::new(MockClient::new());
    let manager = test_manager(client.clone(), 4);
    let recorder = Arc::new(Recorder::default());

    let loader = BulkLoaderBuilder::<u64>::new("T")
        .column("a", ColumnType::Int)
        .column("b", ColumnType::Text)
        .trigger_size(3)
        .on_success(recorder.on_success())
        .on_failure(recorder.on_failure())
        .build(manager)
        .unwrap();

    loader.insert(1, vec![Value::Int(1), Value::Text("x".into())]).await.unwrap();
    loader.insert(2, vec![Value::Int(2), Value::Text("y".into())]).await.unwrap();
    loader.insert(3, vec![Value::Int(3), Value::Text("z".into())]).await.unwrap();

    loader.drain().await.unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].table, "T");
    assert!(!calls[0].upsert);
    assert_eq!(
        calls[0].rows,
        vec![
            vec![Value::Int(1), Value::Text("x".into())],
            vec![Value::Int(2), Value::Text("y".into())],
            vec![Value::Int(3), Value::Text("z".into())],
        ]
    );

    let successes = recorder.successes.lock().unwrap();
    let mut handles: Vec<u64> = successes.iter().map(|(h, _)| *h).collect();
    handles.sort();
    assert_eq!(handles, vec![1, 2, 3]);

    assert_eq!(loader.completed(), 3);
    assert_eq!(loader.outstanding(), 0);
    assert_eq!(loader.failed(), 0);
}

/// Scenario 2: sub-trigger flush submits exactly one short batch.
#[tokio::test]
async fn sub_trigger_flush_submits_one_batch() {
    let client = Arc::new(MockClient::new());
    let manager = test_manager(client.clone(), 4);
    let recorder = Arc::new(Recorder::default());

    let loader = BulkLoaderBuilder::<u64>::new("T")
        .column("a", ColumnType::Int)
        .trigger_size(10)
        .on_success(recorder.on_success())
        .on_failure(recorder.on_failure())
        .build(manager)
        .unwrap();

    for i in 1..=4u64 {
        loader.insert(i, vec![Value::Int(i as i64)]).await.unwrap();
    }

    loader.flush().await.unwrap();
    loader.drain().await.unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].rows.len(), 4);
    assert_eq!(loader.completed(), 4);
}

/// Scenario 3: one bad row (fails coercion) is pulled out of the batch;
/// the rest succeed together.
#[tokio::test]
async fn bad_row_is_pulled_from_batch() {
    let client = Arc::new(MockClient::new());
    let manager = test_manager(client.clone(), 4);
    let recorder = Arc::new(Recorder::default());

    let loader = BulkLoaderBuilder::<u64>::new("T")
        .column("a", ColumnType::Int)
        .column("b", ColumnType::Int)
        .trigger_size(3)
        .on_success(recorder.on_success())
        .on_failure(recorder.on_failure())
        .build(manager)
        .unwrap();

    loader.insert(1, vec![Value::Int(10), Value::Int(20)]).await.unwrap();
    loader
        .insert(2, vec![Value::Int(11), Value::Text("not-an-int".into())])
        .await
        .unwrap();
    loader.insert(3, vec![Value::Int(12), Value::Int(22)]).await.unwrap();

    loader.drain().await.unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].rows.len(), 2);

    let failures = recorder.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, 2);

    let successes = recorder.successes.lock().unwrap();
    assert!(!successes.iter().any(|(h, _)| *h == 2));

    assert_eq!(loader.completed(), 2);
    assert_eq!(loader.failed(), 1);
}

/// Scenario 4: a rejected batch is retried row-by-row; only the row that
/// fails again is reported as failed.
#[tokio::test]
async fn batch_failure_falls_back_to_row_by_row() {
    let client = Arc::new(MockClient::new());
    client.push_script(Scripted::Respond(CallResponse::user_error("batch rejected")));
    client.push_script(Scripted::Respond(CallResponse::success()));
    client.push_script(Scripted::Respond(CallResponse::user_error("row 2 still bad")));

    let manager = test_manager(client.clone(), 4);
    let recorder = Arc::new(Recorder::default());

    let loader = BulkLoaderBuilder::<u64>::new("T")
        .column("a", ColumnType::Int)
        .trigger_size(2)
        .on_success(recorder.on_success())
        .on_failure(recorder.on_failure())
        .build(manager)
        .unwrap();

    loader.insert(1, vec![Value::Int(1)]).await.unwrap();
    loader.insert(2, vec![Value::Int(2)]).await.unwrap();

    loader.drain().await.unwrap();

    assert_eq!(client.calls().len(), 3);

    let successes = recorder.successes.lock().unwrap();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].0, 1);

    let failures = recorder.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, 2);

    assert_eq!(loader.completed(), 1);
    assert_eq!(loader.failed(), 1);
}

/// Scenario 5: the client is unreachable on first submit; once
/// `notify_reconnected` fires the same batch goes through and both rows
/// succeed. `notify_reconnected` is retried rather than timed exactly,
/// since the park point is not independently observable from the test.
#[tokio::test]
async fn connection_loss_parks_then_resubmits_on_reconnect() {
    let client = Arc::new(MockClient::new());
    client.push_script(Scripted::Unreachable);

    let manager = test_manager(client.clone(), 4);
    let recorder = Arc::new(Recorder::default());

    let loader = BulkLoaderBuilder::<u64>::new("T")
        .column("a", ColumnType::Int)
        .trigger_size(2)
        .auto_reconnect(true)
        .on_success(recorder.on_success())
        .on_failure(recorder.on_failure())
        .build(manager.clone())
        .unwrap();

    loader.insert(1, vec![Value::Int(1)]).await.unwrap();
    loader.insert(2, vec![Value::Int(2)]).await.unwrap();

    let nudger = {
        let manager = manager.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                manager.notify_reconnected();
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
    };

    loader.drain().await.unwrap();
    nudger.abort();

    let successes = recorder.successes.lock().unwrap();
    let mut handles: Vec<u64> = successes.iter().map(|(h, _)| *h).collect();
    handles.sort();
    assert_eq!(handles, vec![1, 2]);
    assert_eq!(loader.failed(), 0);
    assert_eq!(loader.completed(), 2);
}

/// Scenario 6: two loaders share a table; the shard's trigger size becomes
/// the minimum of both, and a mixed batch updates each loader's own
/// completed count by its own contribution.
#[tokio::test]
async fn two_loaders_share_a_table() {
    let client = Arc::new(MockClient::new());
    let manager = test_manager(client.clone(), 4);
    let recorder_a = Arc::new(Recorder::default());
    let recorder_b = Arc::new(Recorder::default());

    let loader_a = BulkLoaderBuilder::<u64>::new("T")
        .column("a", ColumnType::Int)
        .trigger_size(5)
        .on_success(recorder_a.on_success())
        .on_failure(recorder_a.on_failure())
        .build(manager.clone())
        .unwrap();

    let loader_b = BulkLoaderBuilder::<u64>::new("T")
        .column("a", ColumnType::Int)
        .trigger_size(3)
        .on_success(recorder_b.on_success())
        .on_failure(recorder_b.on_failure())
        .build(manager)
        .unwrap();

    loader_a.insert(100, vec![Value::Int(1)]).await.unwrap();
    loader_a.insert(101, vec![Value::Int(2)]).await.unwrap();
    loader_b.insert(200, vec![Value::Int(3)]).await.unwrap();

    loader_a.drain().await.unwrap();
    loader_b.drain().await.unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].rows.len(), 3);

    assert_eq!(loader_a.completed(), 2);
    assert_eq!(loader_b.completed(), 1);

    let successes_a = recorder_a.successes.lock().unwrap();
    let successes_b = recorder_b.successes.lock().unwrap();
    assert_eq!(successes_a.len(), 2);
    assert_eq!(successes_b.len(), 1);
}
