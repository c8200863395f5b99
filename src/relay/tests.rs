use super::*;
use crate::client::{MessageQueue, RowSink};
use crate::config::{AckPolicy, FailurePolicy, RelaySettings, TargetSettings};
use crate::message::{IdempotencyKey, ReceivedMessage, Row, TableRef};
use crate::persistence::DeadLetterStore;
use crate::utils::{InsertError, QueueError, RelayError};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeQueue {
    batches: Mutex<VecDeque<Vec<ReceivedMessage>>>,
    pulls: AtomicUsize,
    acks: Mutex<Vec<Vec<String>>>,
    block_when_drained: bool,
}

impl FakeQueue {
    fn with_batches(batches: Vec<Vec<ReceivedMessage>>) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(batches.into()),
            ..Self::default()
        })
    }

    fn blocking(batches: Vec<Vec<ReceivedMessage>>) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(batches.into()),
            block_when_drained: true,
            ..Self::default()
        })
    }

    fn acks(&self) -> Vec<Vec<String>> {
        self.acks.lock().unwrap().clone()
    }

    fn acked_ids(&self) -> Vec<String> {
        self.acks().into_iter().flatten().collect()
    }
}

#[async_trait]
impl MessageQueue for FakeQueue {
    async fn pull(
        &self,
        _subscription: &str,
        max_messages: u32,
        _return_immediately: bool,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(batch) => {
                assert!(batch.len() <= max_messages as usize);
                Ok(batch)
            }
            None if self.block_when_drained => std::future::pending().await,
            None => Ok(Vec::new()),
        }
    }

    async fn acknowledge(&self, _subscription: &str, ack_ids: &[String]) -> Result<(), QueueError> {
        self.acks.lock().unwrap().push(ack_ids.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct FakeSink {
    inserted: Mutex<Vec<(Row, IdempotencyKey)>>,
    /// Scripted results, consumed one per insert; `Ok` once exhausted.
    script: Mutex<VecDeque<Result<(), InsertError>>>,
    cancel_after_first: Option<CancellationToken>,
    retries_seen: Mutex<Vec<u32>>,
}

impl FakeSink {
    fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn scripted(script: Vec<Result<(), InsertError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        })
    }

    fn rows(&self) -> Vec<Row> {
        self.inserted
            .lock()
            .unwrap()
            .iter()
            .map(|(row, _)| row.clone())
            .collect()
    }

    fn insert_count(&self) -> usize {
        self.inserted.lock().unwrap().len()
    }
}

#[async_trait]
impl RowSink for FakeSink {
    async fn insert_row(
        &self,
        _table: &TableRef,
        row: &Row,
        insert_id: &IdempotencyKey,
        num_retries: u32,
    ) -> Result<(), InsertError> {
        self.inserted
            .lock()
            .unwrap()
            .push((row.clone(), insert_id.clone()));
        self.retries_seen.lock().unwrap().push(num_retries);
        if let Some(token) = &self.cancel_after_first {
            token.cancel();
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or(Ok(()))
    }
}

/// Never finishes an insert within the lifetime of a test.
struct HangingSink;

#[async_trait]
impl RowSink for HangingSink {
    async fn insert_row(
        &self,
        _table: &TableRef,
        _row: &Row,
        _insert_id: &IdempotencyKey,
        _num_retries: u32,
    ) -> Result<(), InsertError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn target() -> TargetSettings {
    TargetSettings {
        project_id: "taxi-project".into(),
        dataset_id: "telemetry".into(),
        table_id: "trips".into(),
        subscription: "trips-sub".into(),
    }
}

fn settings() -> RelaySettings {
    RelaySettings {
        empty_backoff_initial_ms: 1,
        empty_backoff_max_ms: 5,
        ..RelaySettings::default()
    }
}

fn message(n: usize, payload: &str) -> ReceivedMessage {
    ReceivedMessage {
        ack_id: format!("ack-{n}"),
        message_id: n.to_string(),
        data: STANDARD.encode(payload),
        publish_time: None,
        attributes: HashMap::new(),
    }
}

fn batch_of(n: usize) -> Vec<ReceivedMessage> {
    (1..=n).map(|i| message(i, &format!(r#"{{"a":{i}}}"#))).collect()
}

fn relay(queue: &Arc<FakeQueue>, sink: &Arc<FakeSink>, settings: RelaySettings) -> Relay {
    Relay::new(queue.clone(), sink.clone(), &target(), settings)
}

fn rejected() -> Result<(), InsertError> {
    Err(InsertError::Rejected("row 0: no such field. (invalid)".into()))
}

#[tokio::test]
async fn every_pulled_message_is_acknowledged_once() {
    for n in [1usize, 3, 57, 100] {
        let queue = FakeQueue::with_batches(vec![batch_of(n)]);
        let sink = FakeSink::scripted(vec![Ok(()), rejected()]);
        let mut relay = relay(&queue, &sink, settings());

        let outcome = relay.step(&CancellationToken::new()).await.unwrap();

        let StepOutcome::Processed(report) = outcome else {
            panic!("expected a processed batch, got {outcome:?}");
        };
        assert_eq!(report.received, n);
        assert_eq!(report.acknowledged, n);
        assert_eq!(queue.acks().len(), 1, "one acknowledge call per batch");

        let acked = queue.acked_ids();
        let unique: HashSet<_> = acked.iter().collect();
        assert_eq!(acked.len(), n);
        assert_eq!(unique.len(), n);
    }
}

#[tokio::test]
async fn rows_are_forwarded_unchanged_with_configured_retries() {
    let payload = r#"{"taxi_id":"cab-3","temp":21.5,"pm25":[3,4],"loc":{"lat":49.2,"lon":-123.1}}"#;
    let queue = FakeQueue::with_batches(vec![vec![message(1, payload)]]);
    let sink = FakeSink::ok();
    let mut relay = relay(&queue, &sink, settings());

    relay.step(&CancellationToken::new()).await.unwrap();

    let expected: serde_json::Value = serde_json::from_str(payload).unwrap();
    assert_eq!(sink.rows(), vec![expected.as_object().unwrap().clone()]);
    assert_eq!(*sink.retries_seen.lock().unwrap(), vec![5]);
}

#[tokio::test]
async fn idempotency_keys_are_unique_across_batches() {
    let queue = FakeQueue::with_batches(vec![batch_of(40), batch_of(40), batch_of(20)]);
    let sink = FakeSink::ok();
    let mut relay = relay(&queue, &sink, settings());
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        relay.step(&cancel).await.unwrap();
    }

    let keys: HashSet<_> = sink
        .inserted
        .lock()
        .unwrap()
        .iter()
        .map(|(_, key)| key.clone())
        .collect();
    assert_eq!(sink.insert_count(), 100);
    assert_eq!(keys.len(), 100);
}

#[tokio::test]
async fn empty_pull_inserts_and_acknowledges_nothing() {
    let queue = FakeQueue::with_batches(vec![]);
    let sink = FakeSink::ok();
    let mut relay = relay(&queue, &sink, settings());
    let cancel = CancellationToken::new();

    assert_eq!(relay.step(&cancel).await.unwrap(), StepOutcome::Idle);
    assert_eq!(relay.step(&cancel).await.unwrap(), StepOutcome::Idle);

    assert_eq!(queue.pulls.load(Ordering::SeqCst), 2);
    assert_eq!(sink.insert_count(), 0);
    assert!(queue.acks().is_empty());
    assert_eq!(relay.stats().empty_pulls, 2);
}

#[tokio::test]
async fn cancelled_token_stops_before_pulling() {
    let queue = FakeQueue::with_batches(vec![batch_of(2)]);
    let sink = FakeSink::ok();
    let mut relay = relay(&queue, &sink, settings());
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert_eq!(relay.step(&cancel).await.unwrap(), StepOutcome::Cancelled);
    assert_eq!(queue.pulls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_mid_batch_stops_inserts_and_acks() {
    let cancel = CancellationToken::new();
    let queue = FakeQueue::with_batches(vec![batch_of(3)]);
    let sink = Arc::new(FakeSink {
        cancel_after_first: Some(cancel.clone()),
        ..FakeSink::default()
    });
    let mut relay = relay(&queue, &sink, settings());

    let outcome = relay.step(&cancel).await.unwrap();

    assert_eq!(outcome, StepOutcome::Cancelled);
    assert_eq!(sink.insert_count(), 1);
    assert!(queue.acks().is_empty());
}

#[tokio::test]
async fn invalid_json_is_fatal_after_acknowledging_earlier_messages() {
    let queue = FakeQueue::with_batches(vec![vec![
        message(1, r#"{"a":1}"#),
        message(2, r#"{"a":2}"#),
        message(3, "invalid-json"),
    ]]);
    let sink = FakeSink::ok();
    let mut relay = relay(&queue, &sink, settings());

    let err = relay.step(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, RelayError::Decode { ref message_id, .. } if message_id == "3"));
    assert_eq!(
        sink.rows(),
        vec![
            json!({"a": 1}).as_object().unwrap().clone(),
            json!({"a": 2}).as_object().unwrap().clone(),
        ]
    );
    assert_eq!(queue.acked_ids(), vec!["ack-1", "ack-2"]);
}

#[tokio::test]
async fn exhausted_insert_retries_are_fatal() {
    let queue = FakeQueue::with_batches(vec![batch_of(3)]);
    let sink = FakeSink::scripted(vec![
        Ok(()),
        Err(InsertError::Exhausted {
            attempts: 6,
            last: "HTTP 503".into(),
        }),
    ]);
    let mut relay = relay(&queue, &sink, settings());

    let err = relay.step(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, RelayError::Insert { ref message_id, .. } if message_id == "2"));
    assert_eq!(sink.insert_count(), 2);
    assert_eq!(queue.acked_ids(), vec!["ack-1"]);
}

#[tokio::test]
async fn rejected_rows_are_acknowledged_after_attempt() {
    let queue = FakeQueue::with_batches(vec![batch_of(3)]);
    let sink = FakeSink::scripted(vec![Ok(()), rejected(), Ok(())]);
    let mut relay = relay(&queue, &sink, settings());

    let outcome = relay.step(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        outcome,
        StepOutcome::Processed(BatchReport {
            received: 3,
            inserted: 2,
            failed: 1,
            acknowledged: 3,
        })
    );
    assert_eq!(queue.acked_ids(), vec!["ack-1", "ack-2", "ack-3"]);
}

#[tokio::test]
async fn ack_after_insert_leaves_failures_for_redelivery() {
    let queue = FakeQueue::with_batches(vec![batch_of(3)]);
    let sink = FakeSink::scripted(vec![Ok(()), rejected(), Ok(())]);
    let mut relay = relay(
        &queue,
        &sink,
        RelaySettings {
            ack_policy: AckPolicy::AfterInsert,
            ..settings()
        },
    );

    relay.step(&CancellationToken::new()).await.unwrap();

    assert_eq!(queue.acked_ids(), vec!["ack-1", "ack-3"]);
}

#[tokio::test]
async fn ack_after_insert_skips_acknowledge_when_nothing_inserted() {
    let queue = FakeQueue::with_batches(vec![batch_of(2)]);
    let sink = FakeSink::scripted(vec![rejected(), rejected()]);
    let mut relay = relay(
        &queue,
        &sink,
        RelaySettings {
            ack_policy: AckPolicy::AfterInsert,
            ..settings()
        },
    );

    relay.step(&CancellationToken::new()).await.unwrap();

    assert!(queue.acks().is_empty());
}

#[tokio::test]
async fn dead_letter_policy_records_failures_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let store = DeadLetterStore::open(dir.path().to_str().unwrap(), None, None).unwrap();
    let queue = FakeQueue::with_batches(vec![vec![
        message(1, r#"{"a":1}"#),
        message(2, "invalid-json"),
        message(3, r#"{"a":3}"#),
        message(4, r#"{"a":4}"#),
    ]]);
    let sink = FakeSink::scripted(vec![
        Ok(()),
        Err(InsertError::Exhausted {
            attempts: 6,
            last: "HTTP 503".into(),
        }),
    ]);
    let mut relay = relay(
        &queue,
        &sink,
        RelaySettings {
            failure_policy: FailurePolicy::DeadLetter,
            ..settings()
        },
    )
    .with_dead_letters(store.clone());

    let outcome = relay.step(&CancellationToken::new()).await.unwrap();

    let StepOutcome::Processed(report) = outcome else {
        panic!("expected a processed batch, got {outcome:?}");
    };
    assert_eq!(report.inserted, 2);
    assert_eq!(report.failed, 2);
    assert_eq!(queue.acked_ids(), vec!["ack-1", "ack-2", "ack-3", "ack-4"]);

    let letters = store.load().unwrap();
    let ids: Vec<_> = letters.iter().map(|l| l.message_id.as_str()).collect();
    assert_eq!(ids, vec!["2", "3"]);
    assert!(letters[0].reason.contains("JSON"));
}

#[tokio::test]
async fn run_stops_on_cancel_while_waiting_for_messages() {
    let queue = FakeQueue::blocking(vec![batch_of(2)]);
    let sink = FakeSink::ok();
    let relay = relay(&queue, &sink, settings());
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(relay.run(cancel.clone()));
    while queue.pulls.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let stats = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("relay did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.received, 2);
    assert_eq!(stats.acknowledged, 2);
}

#[tokio::test]
async fn subscription_and_table_come_from_target() {
    let queue = FakeQueue::with_batches(vec![]);
    let sink = FakeSink::ok();
    let relay = relay(&queue, &sink, settings());

    assert_eq!(
        relay.subscription(),
        "projects/taxi-project/subscriptions/trips-sub"
    );
    assert_eq!(relay.table().to_string(), "taxi-project.telemetry.trips");
}

#[tokio::test]
async fn cancellation_interrupts_an_insert_in_flight() {
    let queue = FakeQueue::with_batches(vec![batch_of(2)]);
    let relay = Relay::new(queue.clone(), Arc::new(HangingSink), &target(), settings());
    let cancel = CancellationToken::new();

    let handle = tokio::spawn(relay.run(cancel.clone()));
    while queue.pulls.load(Ordering::SeqCst) < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let stats = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("relay did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(stats.batches, 0);
    assert!(queue.acks().is_empty());
}

#[tokio::test]
async fn pulled_payloads_are_traced_at_debug() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let queue = FakeQueue::with_batches(vec![batch_of(2)]);
    let sink = FakeSink::ok();
    let mut relay = relay(&queue, &sink, settings());
    relay.step(&CancellationToken::new()).await.unwrap();

    let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
    assert!(output.contains(r#"pulled message 1: {"a":1}"#), "{output}");
    assert!(output.contains(r#"pulled message 2: {"a":2}"#), "{output}");
}
