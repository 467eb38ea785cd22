//! Collaborator interfaces: the source queue consumer and the destination stream.
//!
//! The engine never talks to a network client directly. Concrete queue and
//! stream clients implement these traits; [`crate::local`] provides file-backed
//! implementations for smoke runs.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use streambridge_types::message::RawMessage;
use streambridge_types::state::PartitionId;

/// Pull-based, partition-aware source queue.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Fetch the next messages, waiting at most `max_wait`.
    ///
    /// Returns an empty vector when nothing arrived in time. Messages of one
    /// partition are returned in offset order.
    async fn poll(&self, max_wait: Duration) -> Result<Vec<RawMessage>, SourceError>;

    /// Commit `offset` as the highest fully resolved offset of `partition`.
    async fn commit(&self, partition: PartitionId, offset: u64) -> Result<(), SourceError>;

    /// Committed offsets already recorded by the queue, used to seed the tracker.
    async fn committed_offsets(&self) -> Result<BTreeMap<PartitionId, u64>, SourceError>;

    /// A bounded source returns `true` once every message has been handed out.
    fn is_finished(&self) -> bool {
        false
    }
}

/// Append-only stream supporting partial-success batch puts.
#[async_trait]
pub trait DestinationStream: Send + Sync {
    /// Submit `records`; on success returns one result per record, in order.
    async fn put_batch(&self, records: &[PutRecord]) -> Result<Vec<PutRecordResult>, DestinationError>;
}

/// One record in a destination put request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutRecord {
    pub partition_key: String,
    #[serde(with = "bytes_as_string")]
    pub data: Bytes,
}

/// Per-record result of a put request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PutRecordResult {
    Ok {
        sequence_number: String,
        shard_id: String,
    },
    Err {
        error_code: String,
        error_message: String,
    },
}

impl PutRecordResult {
    #[must_use]
    pub fn ok(sequence_number: impl Into<String>, shard_id: impl Into<String>) -> Self {
        Self::Ok {
            sequence_number: sequence_number.into(),
            shard_id: shard_id.into(),
        }
    }

    #[must_use]
    pub fn err(error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self::Err {
            error_code: error_code.into(),
            error_message: error_message.into(),
        }
    }
}

/// Whole-request failure classes reported by a destination client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationErrorKind {
    Throttled,
    Transient,
    Network,
    Auth,
    NotFound,
    Malformed,
    Internal,
}

impl fmt::Display for DestinationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Throttled => "throttled",
            Self::Transient => "transient",
            Self::Network => "network",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Malformed => "malformed",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// The destination rejected or never received the whole put request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("destination {kind} error {code}: {message}")]
pub struct DestinationError {
    pub kind: DestinationErrorKind,
    pub code: String,
    pub message: String,
}

impl DestinationError {
    #[must_use]
    pub fn new(kind: DestinationErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(DestinationErrorKind::Network, "NETWORK_ERROR", message)
    }

    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(DestinationErrorKind::Auth, "AUTH_FAILED", message)
    }
}

/// Source queue failure.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The queue could not be reached or returned an error for the call.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// Committing an offset was refused.
    #[error("commit of {partition}@{offset} failed: {message}")]
    Commit {
        partition: PartitionId,
        offset: u64,
        message: String,
    },
    #[error("source i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("source state error: {0}")]
    State(#[from] streambridge_state::StateError),
}

mod bytes_as_string {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(Bytes::from(text))
    }
}
