//! File-backed collaborators for smoke runs without network clients.
//!
//! `FileQueueConsumer` treats `<dir>/<partition>.jsonl` as a partition whose
//! offsets are line indices. `FileDestinationStream` appends every accepted
//! record as a JSON line to a file or stdout.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use streambridge_state::StateBackend;
use streambridge_types::message::RawMessage;
use streambridge_types::state::{PartitionId, PipelineId};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::connector::{
    DestinationError, DestinationErrorKind, DestinationStream, PutRecord, PutRecordResult,
    QueueConsumer, SourceError,
};

const DEFAULT_MAX_POLL_RECORDS: usize = 500;
const LOCAL_SHARD_ID: &str = "shardId-000000000000";

#[derive(Debug, Clone, Deserialize)]
pub struct FileSourceConfig {
    pub dir: PathBuf,
    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,
    /// Keep polling for appended lines instead of finishing at end of input.
    #[serde(default)]
    pub follow: bool,
}

fn default_max_poll_records() -> usize {
    DEFAULT_MAX_POLL_RECORDS
}

#[derive(Debug, Default)]
struct PartitionFile {
    path: PathBuf,
    /// Line index of the next message to hand out.
    next_offset: u64,
}

#[derive(Debug, Default)]
struct SourceCursor {
    partitions: BTreeMap<PartitionId, PartitionFile>,
    started: bool,
}

/// Reads JSON-lines partition files; commits through the state backend.
pub struct FileQueueConsumer {
    config: FileSourceConfig,
    pipeline: PipelineId,
    state: Arc<dyn StateBackend>,
    cursor: Mutex<SourceCursor>,
    finished: AtomicBool,
}

impl FileQueueConsumer {
    /// Build a consumer from a `source.config` value.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is malformed or `dir` is not a directory.
    pub fn from_config(
        config: &serde_json::Value,
        pipeline: PipelineId,
        state: Arc<dyn StateBackend>,
    ) -> anyhow::Result<Self> {
        let config: FileSourceConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("invalid file source config: {e}"))?;
        if !config.dir.is_dir() {
            anyhow::bail!("file source dir {} is not a directory", config.dir.display());
        }
        Ok(Self {
            config,
            pipeline,
            state,
            cursor: Mutex::new(SourceCursor::default()),
            finished: AtomicBool::new(false),
        })
    }

    async fn discover(&self, cursor: &mut SourceCursor) -> Result<(), SourceError> {
        let committed = self.committed_offsets().await?;
        let mut entries = tokio::fs::read_dir(&self.config.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(partition) = partition_of(&path) else {
                continue;
            };
            let next_offset = committed.get(&partition).map_or(0, |c| c + 1);
            cursor
                .partitions
                .entry(partition)
                .or_insert(PartitionFile { path, next_offset });
        }
        cursor.started = true;
        tracing::debug!(
            dir = %self.config.dir.display(),
            partitions = cursor.partitions.len(),
            "Discovered partition files"
        );
        Ok(())
    }

    async fn read_batch(&self, cursor: &mut SourceCursor) -> Result<Vec<RawMessage>, SourceError> {
        let mut messages = Vec::new();
        for (&partition, file) in &mut cursor.partitions {
            if messages.len() >= self.config.max_poll_records {
                break;
            }
            let content = tokio::fs::read_to_string(&file.path).await?;
            let start = usize::try_from(file.next_offset).unwrap_or(usize::MAX);
            for (index, raw) in content.split_inclusive('\n').enumerate().skip(start) {
                if messages.len() >= self.config.max_poll_records {
                    break;
                }
                // A trailing line without a newline may still be mid-write.
                if self.config.follow && !raw.ends_with('\n') {
                    break;
                }
                let line = raw.trim_end_matches(['\n', '\r']);
                let offset = index as u64;
                file.next_offset = offset + 1;
                if line.trim().is_empty() {
                    continue;
                }
                messages.push(RawMessage::new(partition, offset, Bytes::from(line.to_string())));
            }
        }
        Ok(messages)
    }
}

fn partition_of(path: &Path) -> Option<PartitionId> {
    if path.extension()? != "jsonl" {
        return None;
    }
    path.file_stem()?.to_str()?.parse::<i32>().ok().map(PartitionId::new)
}

#[async_trait]
impl QueueConsumer for FileQueueConsumer {
    async fn poll(&self, max_wait: Duration) -> Result<Vec<RawMessage>, SourceError> {
        let mut cursor = self.cursor.lock().await;
        if !cursor.started {
            self.discover(&mut cursor).await?;
        }
        let messages = self.read_batch(&mut cursor).await?;
        drop(cursor);

        if messages.is_empty() {
            if !self.config.follow {
                self.finished.store(true, Ordering::Release);
                return Ok(messages);
            }
            tokio::time::sleep(max_wait).await;
        }
        Ok(messages)
    }

    async fn commit(&self, partition: PartitionId, offset: u64) -> Result<(), SourceError> {
        self.state.commit_offset(&self.pipeline, partition, offset)?;
        Ok(())
    }

    async fn committed_offsets(&self) -> Result<BTreeMap<PartitionId, u64>, SourceError> {
        Ok(self
            .state
            .committed_offsets(&self.pipeline)?
            .into_iter()
            .map(|c| (c.partition, c.offset))
            .collect())
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileDestinationConfig {
    pub path: PathBuf,
}

enum Sink {
    File(tokio::fs::File),
    Stdout(tokio::io::Stdout),
}

/// Appends put records as JSON lines.
pub struct FileDestinationStream {
    sink: Mutex<Sink>,
    sequence: AtomicU64,
}

impl FileDestinationStream {
    /// Open (creating if needed) the file named by a `destination.config` value.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is malformed or the file cannot be opened.
    pub async fn from_config(config: &serde_json::Value) -> anyhow::Result<Self> {
        let config: FileDestinationConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("invalid file destination config: {e}"))?;
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .await
            .map_err(|e| anyhow::anyhow!("failed to open {}: {e}", config.path.display()))?;
        Ok(Self::with_sink(Sink::File(file)))
    }

    #[must_use]
    pub fn stdout() -> Self {
        Self::with_sink(Sink::Stdout(tokio::io::stdout()))
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            sink: Mutex::new(sink),
            sequence: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl DestinationStream for FileDestinationStream {
    async fn put_batch(&self, records: &[PutRecord]) -> Result<Vec<PutRecordResult>, DestinationError> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record).map_err(|e| {
                DestinationError::new(DestinationErrorKind::Malformed, "SerializationException", e.to_string())
            })?;
            buf.push(b'\n');
        }

        let io_error = |e: std::io::Error| DestinationError::network(e.to_string());
        let mut sink = self.sink.lock().await;
        match &mut *sink {
            Sink::File(file) => {
                file.write_all(&buf).await.map_err(io_error)?;
                file.flush().await.map_err(io_error)?;
            }
            Sink::Stdout(out) => {
                out.write_all(&buf).await.map_err(io_error)?;
                out.flush().await.map_err(io_error)?;
            }
        }
        drop(sink);

        Ok(records
            .iter()
            .map(|_| {
                let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
                PutRecordResult::ok(format!("{seq:020}"), LOCAL_SHARD_ID)
            })
            .collect())
    }
}

/// In-memory partition map used when the caller supplies messages directly.
///
/// Handy for `validate` runs and tests that want a finite source without files.
pub struct MemoryQueueConsumer {
    pending: Mutex<Vec<RawMessage>>,
    committed: std::sync::Mutex<HashMap<PartitionId, u64>>,
    finished: AtomicBool,
}

impl MemoryQueueConsumer {
    #[must_use]
    pub fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            pending: Mutex::new(messages),
            committed: std::sync::Mutex::new(HashMap::new()),
            finished: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl QueueConsumer for MemoryQueueConsumer {
    async fn poll(&self, _max_wait: Duration) -> Result<Vec<RawMessage>, SourceError> {
        let messages = std::mem::take(&mut *self.pending.lock().await);
        if messages.is_empty() {
            self.finished.store(true, Ordering::Release);
        }
        Ok(messages)
    }

    async fn commit(&self, partition: PartitionId, offset: u64) -> Result<(), SourceError> {
        self.committed
            .lock()
            .map_err(|_| SourceError::Unavailable("commit map poisoned".into()))?
            .insert(partition, offset);
        Ok(())
    }

    async fn committed_offsets(&self) -> Result<BTreeMap<PartitionId, u64>, SourceError> {
        let committed = self
            .committed
            .lock()
            .map_err(|_| SourceError::Unavailable("commit map poisoned".into()))?;
        Ok(committed.iter().map(|(p, o)| (*p, *o)).collect())
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streambridge_state::SqliteStateBackend;

    fn state() -> Arc<dyn StateBackend> {
        Arc::new(SqliteStateBackend::in_memory().unwrap())
    }

    #[test]
    fn test_partition_from_file_name() {
        assert_eq!(partition_of(Path::new("/x/3.jsonl")), Some(PartitionId::new(3)));
        assert_eq!(partition_of(Path::new("/x/orders.jsonl")), None);
        assert_eq!(partition_of(Path::new("/x/3.json")), None);
    }

    #[tokio::test]
    async fn test_file_source_reads_partitions_and_resumes_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0.jsonl"), "{\"id\":1}\n\n{\"id\":2}\n").unwrap();
        std::fs::write(dir.path().join("1.jsonl"), "{\"id\":3}\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let state = state();
        let config = serde_json::json!({ "dir": dir.path() });
        let consumer =
            FileQueueConsumer::from_config(&config, PipelineId::new("p"), Arc::clone(&state)).unwrap();

        let messages = consumer.poll(Duration::from_millis(10)).await.unwrap();
        let positions: Vec<String> = messages.iter().map(|m| m.position().to_string()).collect();
        assert_eq!(positions, vec!["0@0", "0@2", "1@0"]);
        assert!(consumer.poll(Duration::from_millis(10)).await.unwrap().is_empty());
        assert!(consumer.is_finished());

        consumer.commit(PartitionId::new(0), 0).await.unwrap();
        let resumed =
            FileQueueConsumer::from_config(&config, PipelineId::new("p"), state).unwrap();
        let messages = resumed.poll(Duration::from_millis(10)).await.unwrap();
        let positions: Vec<String> = messages.iter().map(|m| m.position().to_string()).collect();
        assert_eq!(positions, vec!["0@2", "1@0"]);
    }

    #[tokio::test]
    async fn test_file_source_respects_max_poll_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0.jsonl"), "{}\n{}\n{}\n").unwrap();
        let config = serde_json::json!({ "dir": dir.path(), "max_poll_records": 2 });
        let consumer = FileQueueConsumer::from_config(&config, PipelineId::new("p"), state()).unwrap();
        assert_eq!(consumer.poll(Duration::ZERO).await.unwrap().len(), 2);
        assert_eq!(consumer.poll(Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_follow_mode_holds_back_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.jsonl");
        std::fs::write(&path, "{\"a\":1}\n{\"b\":").unwrap();
        let config = serde_json::json!({ "dir": dir.path(), "follow": true });
        let consumer = FileQueueConsumer::from_config(&config, PipelineId::new("p"), state()).unwrap();

        let first = consumer.poll(Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].position().to_string(), "0@0");
        assert!(consumer.poll(Duration::ZERO).await.unwrap().is_empty());
        assert!(!consumer.is_finished());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, b"2}\n").unwrap();

        let second = consumer.poll(Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].position().to_string(), "0@1");
        assert_eq!(second[0].payload.as_ref(), b"{\"b\":2}");
    }

    #[tokio::test]
    async fn test_unterminated_last_line_is_read_without_follow() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0.jsonl"), "{\"a\":1}\r\n{\"b\":2}").unwrap();
        let config = serde_json::json!({ "dir": dir.path() });
        let consumer = FileQueueConsumer::from_config(&config, PipelineId::new("p"), state()).unwrap();
        let messages = consumer.poll(Duration::ZERO).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload.as_ref(), b"{\"a\":1}");
        assert_eq!(messages[1].payload.as_ref(), b"{\"b\":2}");
    }

    #[test]
    fn test_file_source_requires_directory() {
        let config = serde_json::json!({ "dir": "/nonexistent/streambridge" });
        assert!(FileQueueConsumer::from_config(&config, PipelineId::new("p"), state()).is_err());
    }

    #[tokio::test]
    async fn test_file_destination_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("stream.jsonl");
        let dest = FileDestinationStream::from_config(&serde_json::json!({ "path": path }))
            .await
            .unwrap();
        let records = vec![
            PutRecord {
                partition_key: "a".into(),
                data: Bytes::from_static(b"{\"id\":1}"),
            },
            PutRecord {
                partition_key: "b".into(),
                data: Bytes::from_static(b"{\"id\":2}"),
            },
        ];
        let results = dest.put_batch(&records).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[1], PutRecordResult::Ok { ref sequence_number, .. } if sequence_number.ends_with('1')));

        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = written
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["partition_key"], "a");
        assert_eq!(lines[1]["data"], "{\"id\":2}");
    }

    #[tokio::test]
    async fn test_stdout_destination_accepts_every_record() {
        let dest = FileDestinationStream::stdout();
        let records = vec![PutRecord {
            partition_key: "k".into(),
            data: Bytes::from_static(b"{}"),
        }];
        let results = dest.put_batch(&records).await.unwrap();
        assert!(matches!(results.as_slice(), [PutRecordResult::Ok { .. }]));
    }

    #[tokio::test]
    async fn test_memory_consumer_finishes_after_drain() {
        let consumer = MemoryQueueConsumer::new(vec![RawMessage::new(0, 0, "{}")]);
        assert_eq!(consumer.poll(Duration::ZERO).await.unwrap().len(), 1);
        assert!(!consumer.is_finished());
        assert!(consumer.poll(Duration::ZERO).await.unwrap().is_empty());
        assert!(consumer.is_finished());
        consumer.commit(PartitionId::new(0), 0).await.unwrap();
        assert_eq!(
            consumer.committed_offsets().await.unwrap().get(&PartitionId::new(0)),
            Some(&0)
        );
    }
}
