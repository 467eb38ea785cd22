//! Ordered groups of events submitted to the destination in one put.

use std::fmt;

use crate::message::DomainEvent;

/// Identifier assigned by the batcher; increases monotonically per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events in arrival order; per-partition offset order is preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    pub events: Vec<DomainEvent>,
}

impl Batch {
    #[must_use]
    pub fn new(id: BatchId, events: Vec<DomainEvent>) -> Self {
        Self { id, events }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Cumulative put size of every event in the batch.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.events.iter().map(DomainEvent::size_bytes).sum()
    }
}
