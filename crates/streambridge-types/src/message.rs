//! Source messages and the validated events derived from them.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::state::PartitionId;

/// Location of a message in the source queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourcePosition {
    pub partition: PartitionId,
    pub offset: u64,
}

impl SourcePosition {
    #[must_use]
    pub fn new(partition: impl Into<PartitionId>, offset: u64) -> Self {
        Self {
            partition: partition.into(),
            offset,
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// A message as pulled from the source queue, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub partition: PartitionId,
    pub offset: u64,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub enqueued_at: DateTime<Utc>,
}

impl RawMessage {
    /// Build a keyless message stamped with the current time.
    #[must_use]
    pub fn new(partition: impl Into<PartitionId>, offset: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            partition: partition.into(),
            offset,
            key: None,
            payload: payload.into(),
            enqueued_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = at;
        self
    }

    #[must_use]
    pub fn position(&self) -> SourcePosition {
        SourcePosition {
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// A decoded, rule-checked record ready for delivery.
///
/// Always carries the source position it was decoded from so that its
/// resolution can advance the partition's commit point.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    position: SourcePosition,
    fields: Map<String, Value>,
    partition_key: String,
    data: Bytes,
}

impl DomainEvent {
    /// Build an event from validated fields, encoding them as the outbound payload.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the fields cannot be encoded as JSON.
    pub fn new(
        position: SourcePosition,
        fields: Map<String, Value>,
        partition_key: impl Into<String>,
    ) -> Result<Self, serde_json::Error> {
        let data = Bytes::from(serde_json::to_vec(&fields)?);
        Ok(Self {
            position,
            fields,
            partition_key: partition_key.into(),
            data,
        })
    }

    /// Build an event around an already-encoded payload.
    #[must_use]
    pub fn from_encoded(
        position: SourcePosition,
        partition_key: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            position,
            fields: Map::new(),
            partition_key: partition_key.into(),
            data: data.into(),
        }
    }

    #[must_use]
    pub fn position(&self) -> SourcePosition {
        self.position
    }

    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    #[must_use]
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Bytes this event contributes to a put request (payload plus key).
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.data.len() + self.partition_key.len()
    }
}
