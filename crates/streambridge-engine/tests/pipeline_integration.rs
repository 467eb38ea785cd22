//! Integration tests for pipeline parsing, validation, and end-to-end runs.
//!
//! File-backed runs use the fixtures under `tests/fixtures`; delivery
//! behavior is exercised against scripted in-process destinations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use streambridge_engine::config::parser;
use streambridge_engine::config::types::{PipelineConfig, StateBackendKind};
use streambridge_engine::config::validator;
use streambridge_engine::connector::{
    DestinationError, DestinationErrorKind, DestinationStream, PutRecord, PutRecordResult,
    QueueConsumer, SourceError,
};
use streambridge_engine::local::MemoryQueueConsumer;
use streambridge_engine::{
    check_pipeline, run_pipeline, run_with_collaborators, Collaborators, ExecutionOptions,
    PipelineError, PipelineFault,
};
use streambridge_state::{SqliteStateBackend, StateBackend};
use streambridge_types::message::RawMessage;
use streambridge_types::state::{PartitionId, PipelineId};
use tokio_util::sync::CancellationToken;

/// Serializes fixture loading; the fixture reads its paths from env vars.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("tests/fixtures")
}

/// Copy the sample partitions into a scratch dir and load the fixture pipeline.
fn orders_pipeline(scratch: &Path) -> PipelineConfig {
    let orders = scratch.join("orders");
    std::fs::create_dir_all(&orders).unwrap();
    for partition in ["0.jsonl", "1.jsonl"] {
        std::fs::copy(
            fixtures_dir().join("samples/orders").join(partition),
            orders.join(partition),
        )
        .unwrap();
    }

    let _guard = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    std::env::set_var("TEST_ORDERS_DIR", &orders);
    std::env::set_var("TEST_OUTPUT_PATH", scratch.join("out").join("stream.jsonl"));
    let config = parser::parse_pipeline(&fixtures_dir().join("pipelines/orders_bridge.yaml"))
        .expect("Failed to parse fixture pipeline");
    std::env::remove_var("TEST_ORDERS_DIR");
    std::env::remove_var("TEST_OUTPUT_PATH");
    config
}

fn inline_pipeline(extra: &str) -> PipelineConfig {
    parser::parse_pipeline_str(&format!(
        r#"
version: "1.0"
pipeline: scripted
source:
  use: memory
destination:
  use: scripted
batching:
  max_batch_records: 10
  max_batch_window_ms: 20
retry:
  max_retry_attempts: 3
  initial_backoff_ms: 1
  max_backoff_ms: 5
  jitter: 0.0
dlq:
  enabled: true
{extra}"#
    ))
    .unwrap()
}

fn numbered_messages(partition: i32, count: u64) -> Vec<RawMessage> {
    (0..count)
        .map(|offset| {
            RawMessage::new(partition, offset, format!(r#"{{"id":"{partition}-{offset}"}}"#))
        })
        .collect()
}

/// Test parsing and validating the well-formed pipeline fixture.
#[test]
fn test_parse_and_validate_fixture_pipeline() {
    let scratch = tempfile::tempdir().unwrap();
    let config = orders_pipeline(scratch.path());

    assert_eq!(config.pipeline, "orders_bridge");
    assert_eq!(config.source.use_ref, "file");
    assert_eq!(config.destination.use_ref, "file");
    assert_eq!(config.validation.rules.len(), 4);
    assert_eq!(config.batching.max_batch_records, 3);
    assert_eq!(config.batching.max_batch_bytes, 64 * 1024);
    assert_eq!(config.state.backend, StateBackendKind::Memory);
    assert!(config.dlq.enabled);

    validator::validate_pipeline(&config).expect("Validation should pass");
}

/// Test that an unknown state backend is refused while parsing.
#[test]
fn test_parse_invalid_fixture() {
    let result = parser::parse_pipeline(&fixtures_dir().join("pipelines/invalid_pipeline.yaml"));
    let err = format!("{:#}", result.unwrap_err());
    assert!(
        err.contains("unknown variant") || err.contains("Failed to parse pipeline YAML"),
        "Expected serde enum parse error, got: {err}"
    );
}

/// Test that semantic validation reports every problem at once.
#[test]
fn test_validate_reports_all_errors() {
    let config = parser::parse_pipeline(&fixtures_dir().join("pipelines/invalid_rules.yaml"))
        .expect("fixture should parse");
    let err = validator::validate_pipeline(&config).unwrap_err().to_string();
    assert!(err.contains("validation.rules"), "got: {err}");
    assert!(err.contains("max_batch_records"), "got: {err}");
}

#[tokio::test]
async fn test_file_pipeline_end_to_end() {
    let scratch = tempfile::tempdir().unwrap();
    let config = orders_pipeline(scratch.path());

    let result = run_pipeline(&config, &ExecutionOptions::default(), CancellationToken::new())
        .await
        .expect("pipeline should complete");

    assert_eq!(result.counts.records_polled, 9);
    assert_eq!(result.counts.records_delivered, 5);
    assert_eq!(result.counts.records_rejected, 4);
    assert_eq!(result.counts.records_fatal, 0);
    assert_eq!(result.delivery.dlq_records, 4);
    assert_eq!(result.committed.get(&PartitionId::new(0)), Some(&5));
    assert_eq!(result.committed.get(&PartitionId::new(1)), Some(&3));

    let output = std::fs::read_to_string(scratch.path().join("out/stream.jsonl")).unwrap();
    let keys: Vec<String> = output
        .lines()
        .map(|line| {
            let record: serde_json::Value = serde_json::from_str(line).unwrap();
            record["partition_key"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(keys.len(), 5);
    for expected in ["ord-1001", "ord-1003", "ord-1005", "ord-2001", "ord-2002"] {
        assert!(keys.iter().any(|k| k == expected), "missing {expected}");
    }
    // Per-partition order survives batching.
    let pos_1001 = keys.iter().position(|k| k == "ord-1001").unwrap();
    let pos_1005 = keys.iter().position(|k| k == "ord-1005").unwrap();
    assert!(pos_1001 < pos_1005);
}

#[tokio::test]
async fn test_file_pipeline_resumes_after_committed_offsets() {
    let scratch = tempfile::tempdir().unwrap();
    let mut config = orders_pipeline(scratch.path());
    let db_path = scratch.path().join("state.db");
    config.state.backend = StateBackendKind::Sqlite;
    config.state.connection = Some(db_path.display().to_string());

    let first = run_pipeline(&config, &ExecutionOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.counts.records_polled, 9);

    let second = run_pipeline(&config, &ExecutionOptions::default(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.counts.records_polled, 0);
    assert_eq!(second.committed.get(&PartitionId::new(0)), Some(&5));

    let state = SqliteStateBackend::open(&db_path).unwrap();
    let offsets = state
        .committed_offsets(&PipelineId::new("orders_bridge"))
        .unwrap();
    assert_eq!(offsets.len(), 2);
}

#[tokio::test]
async fn test_check_pipeline_fixture() {
    let scratch = tempfile::tempdir().unwrap();
    let config = orders_pipeline(scratch.path());
    let check = check_pipeline(&config).await.unwrap();
    assert!(check.all_ok(), "{check:?}");
    assert_eq!(check.rules_compiled, 7);
}

/// Throttles the odd-indexed records of the first put only.
#[derive(Default)]
struct FlakyStream {
    calls: AtomicU32,
    accepted: Mutex<Vec<String>>,
}

#[async_trait]
impl DestinationStream for FlakyStream {
    async fn put_batch(
        &self,
        records: &[PutRecord],
    ) -> Result<Vec<PutRecordResult>, DestinationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut accepted = self.accepted.lock().unwrap();
        Ok(records
            .iter()
            .enumerate()
            .map(|(i, record)| {
                if call == 0 && i % 2 == 1 {
                    PutRecordResult::err("ProvisionedThroughputExceededException", "slow down")
                } else {
                    accepted.push(record.partition_key.clone());
                    PutRecordResult::ok(format!("{call}-{i}"), "shardId-000000000000")
                }
            })
            .collect())
    }
}

fn collaborators(
    messages: Vec<RawMessage>,
    destination: Arc<dyn DestinationStream>,
) -> (Arc<MemoryQueueConsumer>, Collaborators) {
    let source = Arc::new(MemoryQueueConsumer::new(messages));
    let collaborators = Collaborators {
        source: source.clone(),
        destination,
        state: Arc::new(SqliteStateBackend::in_memory().unwrap()),
    };
    (source, collaborators)
}

#[tokio::test]
async fn test_partial_failures_are_retried_until_delivered() {
    let stream = Arc::new(FlakyStream::default());
    let (_, collaborators) = collaborators(numbered_messages(0, 6), stream.clone());

    let result = run_with_collaborators(
        &inline_pipeline(""),
        collaborators,
        &ExecutionOptions::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.counts.records_delivered, 6);
    assert_eq!(result.counts.records_escalated, 0);
    assert_eq!(result.delivery.batches, 1);
    assert_eq!(result.delivery.put_attempts, 2);
    assert_eq!(result.delivery.retries, 1);
    assert_eq!(result.committed.get(&PartitionId::new(0)), Some(&5));
    assert_eq!(stream.accepted.lock().unwrap().len(), 6);
}

/// Refuses one record as malformed and throttles another forever.
struct StubbornStream {
    calls: AtomicU32,
}

#[async_trait]
impl DestinationStream for StubbornStream {
    async fn put_batch(
        &self,
        records: &[PutRecord],
    ) -> Result<Vec<PutRecordResult>, DestinationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(records
            .iter()
            .map(|record| match record.partition_key.as_str() {
                "0-1" => PutRecordResult::err("ValidationException", "record too large"),
                "0-2" => PutRecordResult::err("ThrottlingException", "rate exceeded"),
                _ => PutRecordResult::ok("1", "shardId-000000000000"),
            })
            .collect())
    }
}

#[tokio::test]
async fn test_fatal_and_escalated_records_do_not_block_commits() {
    let stream = Arc::new(StubbornStream {
        calls: AtomicU32::new(0),
    });
    let (source, collaborators) = collaborators(numbered_messages(0, 4), stream.clone());
    let config = inline_pipeline("validation:\n  partition_key:\n    field: id\n");

    let result = run_with_collaborators(
        &config,
        collaborators,
        &ExecutionOptions::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.counts.records_delivered, 2);
    assert_eq!(result.counts.records_fatal, 1);
    assert_eq!(result.counts.records_escalated, 1);
    assert_eq!(result.delivery.dlq_records, 2);
    // One initial put plus three retries for the throttled record.
    assert_eq!(stream.calls.load(Ordering::SeqCst), 4);

    let committed = source.committed_offsets().await.unwrap();
    assert_eq!(committed.get(&PartitionId::new(0)), Some(&3));
}

struct MissingStream;

#[async_trait]
impl DestinationStream for MissingStream {
    async fn put_batch(
        &self,
        _records: &[PutRecord],
    ) -> Result<Vec<PutRecordResult>, DestinationError> {
        Err(DestinationError::new(
            DestinationErrorKind::NotFound,
            "ResourceNotFoundException",
            "stream orders does not exist",
        ))
    }
}

#[tokio::test]
async fn test_missing_stream_is_a_destination_fault() {
    let (source, collaborators) = collaborators(numbered_messages(3, 5), Arc::new(MissingStream));

    let err = run_with_collaborators(
        &inline_pipeline(""),
        collaborators,
        &ExecutionOptions::default(),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    match err {
        PipelineError::Fault(PipelineFault::Destination(e)) => {
            assert_eq!(e.kind, DestinationErrorKind::NotFound);
        }
        other => panic!("expected destination fault, got {other}"),
    }

    assert!(source.committed_offsets().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_run_drains_and_completes() {
    let stream = Arc::new(FlakyStream::default());
    let (_, collaborators) = collaborators(numbered_messages(0, 3), stream);
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let result = run_with_collaborators(
        &inline_pipeline(""),
        collaborators,
        &ExecutionOptions::default(),
        shutdown,
    )
    .await
    .unwrap();
    assert_eq!(result.counts.records_polled, 0);
    assert!(result.committed.is_empty());
}

/// Hands out its messages once, then keeps the run open until cancelled.
struct OpenQueue {
    inner: MemoryQueueConsumer,
}

#[async_trait]
impl QueueConsumer for OpenQueue {
    async fn poll(&self, max_wait: Duration) -> Result<Vec<RawMessage>, SourceError> {
        let messages = self.inner.poll(max_wait).await?;
        if messages.is_empty() {
            tokio::time::sleep(max_wait).await;
        }
        Ok(messages)
    }

    async fn commit(&self, partition: PartitionId, offset: u64) -> Result<(), SourceError> {
        self.inner.commit(partition, offset).await
    }

    async fn committed_offsets(&self) -> Result<BTreeMap<PartitionId, u64>, SourceError> {
        self.inner.committed_offsets().await
    }
}

fn open_collaborators(
    messages: Vec<RawMessage>,
    destination: Arc<dyn DestinationStream>,
) -> (Arc<OpenQueue>, Collaborators) {
    let source = Arc::new(OpenQueue {
        inner: MemoryQueueConsumer::new(messages),
    });
    let collaborators = Collaborators {
        source: source.clone(),
        destination,
        state: Arc::new(SqliteStateBackend::in_memory().unwrap()),
    };
    (source, collaborators)
}

fn cancel_after(shutdown: &CancellationToken, delay: Duration) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        shutdown.cancel();
    });
}

/// Throttles every record of the first `throttled_calls` puts.
struct ThrottledStream {
    calls: AtomicU32,
    throttled_calls: u32,
}

#[async_trait]
impl DestinationStream for ThrottledStream {
    async fn put_batch(
        &self,
        records: &[PutRecord],
    ) -> Result<Vec<PutRecordResult>, DestinationError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(records
            .iter()
            .map(|_| {
                if call < self.throttled_calls {
                    PutRecordResult::err("ProvisionedThroughputExceededException", "slow down")
                } else {
                    PutRecordResult::ok(call.to_string(), "shardId-000000000000")
                }
            })
            .collect())
    }
}

#[tokio::test]
async fn test_cancel_during_backoff_drains_and_commits() {
    let stream = Arc::new(ThrottledStream {
        calls: AtomicU32::new(0),
        throttled_calls: 2,
    });
    let (source, collaborators) = open_collaborators(numbered_messages(0, 5), stream.clone());
    let mut config = inline_pipeline("");
    config.resources.poll_timeout_ms = 10;
    config.retry.initial_backoff_ms = 300;
    config.retry.max_backoff_ms = 1_000;

    let shutdown = CancellationToken::new();
    // Lands while the first retry is still sleeping.
    cancel_after(&shutdown, Duration::from_millis(150));

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        run_with_collaborators(&config, collaborators, &ExecutionOptions::default(), shutdown.clone()),
    )
    .await
    .expect("run should drain after cancellation")
    .unwrap();

    assert!(shutdown.is_cancelled());
    assert_eq!(result.counts.records_polled, 5);
    assert_eq!(result.counts.records_delivered, 5);
    assert_eq!(result.counts.records_escalated, 0);
    assert_eq!(result.delivery.put_attempts, 3);
    assert_eq!(stream.calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.committed.get(&PartitionId::new(0)), Some(&4));

    let committed = source.committed_offsets().await.unwrap();
    assert_eq!(committed.get(&PartitionId::new(0)), Some(&4));
}

/// Accepts the request and never answers.
struct HungStream;

#[async_trait]
impl DestinationStream for HungStream {
    async fn put_batch(
        &self,
        _records: &[PutRecord],
    ) -> Result<Vec<PutRecordResult>, DestinationError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_hung_destination_is_bounded_by_put_timeout() {
    let (source, collaborators) = open_collaborators(numbered_messages(1, 3), Arc::new(HungStream));
    let mut config = inline_pipeline("");
    config.resources.poll_timeout_ms = 10;
    config.resources.put_timeout_ms = 50;

    let shutdown = CancellationToken::new();
    cancel_after(&shutdown, Duration::from_millis(100));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        run_with_collaborators(&config, collaborators, &ExecutionOptions::default(), shutdown),
    )
    .await
    .expect("a hung put must not stall shutdown")
    .unwrap();

    assert_eq!(result.counts.records_delivered, 0);
    assert_eq!(result.counts.records_escalated, 3);
    // One initial put plus three retries, each cut off by the put timeout.
    assert_eq!(result.delivery.put_attempts, 4);
    assert_eq!(result.delivery.dlq_records, 3);
    assert_eq!(result.committed.get(&PartitionId::new(1)), Some(&2));

    let committed = source.committed_offsets().await.unwrap();
    assert_eq!(committed.get(&PartitionId::new(1)), Some(&2));
}
