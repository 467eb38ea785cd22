//! Per-partition commit cursors.
//!
//! Offsets are registered in poll order and resolved in any order. A
//! partition's commit point only moves over a prefix of registered offsets
//! that are all resolved, so an unresolved offset holds back everything
//! after it in the same partition.
//!
//! Each partition has its own mutex; the partition map itself is behind a
//! read-mostly `RwLock` that is only write-locked to add a partition.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use streambridge_types::message::SourcePosition;
use streambridge_types::state::PartitionId;

#[derive(Debug, Default)]
struct PartitionCursor {
    /// Highest offset covered by the commit point.
    committed: Option<u64>,
    /// Registered offsets above `committed`, mapped to whether they resolved.
    outstanding: BTreeMap<u64, bool>,
    /// Commit point has moved since it was last taken.
    dirty: bool,
}

impl PartitionCursor {
    fn is_covered(&self, offset: u64) -> bool {
        self.committed.is_some_and(|c| offset <= c)
    }

    fn register(&mut self, offset: u64) {
        if !self.is_covered(offset) {
            self.outstanding.entry(offset).or_insert(false);
        }
    }

    fn resolve(&mut self, offset: u64) -> bool {
        if self.is_covered(offset) {
            return false;
        }
        match self.outstanding.get_mut(&offset) {
            Some(resolved) => *resolved = true,
            None => {
                tracing::warn!(offset, "Resolved an offset that was never registered; ignoring");
                return false;
            }
        }

        let before = self.committed;
        while let Some(entry) = self.outstanding.first_entry() {
            if !*entry.get() {
                break;
            }
            let (offset, _) = entry.remove_entry();
            self.committed = Some(offset);
        }
        if self.committed != before {
            self.dirty = true;
            return true;
        }
        false
    }

    fn lowest_unresolved(&self) -> Option<u64> {
        self.outstanding
            .iter()
            .find(|(_, resolved)| !**resolved)
            .map(|(offset, _)| *offset)
    }
}

/// Tracks, per source partition, the highest offset safe to commit.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: RwLock<HashMap<PartitionId, Arc<Mutex<PartitionCursor>>>>,
}

impl OffsetTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cursor(&self, partition: PartitionId) -> Arc<Mutex<PartitionCursor>> {
        if let Some(cursor) = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&partition)
        {
            return Arc::clone(cursor);
        }
        let mut partitions = self
            .partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(partitions.entry(partition).or_default())
    }

    fn with_cursor<T>(&self, partition: PartitionId, f: impl FnOnce(&mut PartitionCursor) -> T) -> T {
        let cursor = self.cursor(partition);
        let mut guard = cursor.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Restore a partition's commit point from previously committed state.
    ///
    /// Never moves an existing commit point backwards.
    pub fn seed(&self, partition: PartitionId, committed: u64) {
        self.with_cursor(partition, |cursor| {
            if cursor.committed.is_some_and(|c| c >= committed) {
                return;
            }
            cursor.committed = Some(committed);
            cursor.outstanding = cursor.outstanding.split_off(&committed.saturating_add(1));
        });
    }

    /// Register a polled offset as in flight. Must be called in poll order.
    pub fn register(&self, position: SourcePosition) {
        self.with_cursor(position.partition, |cursor| cursor.register(position.offset));
    }

    /// Mark an offset terminally resolved (delivered, fatal, escalated or rejected).
    ///
    /// Returns `true` when the partition's commit point advanced. Offsets at
    /// or below the commit point (redeliveries) are ignored.
    pub fn resolve(&self, position: SourcePosition) -> bool {
        self.with_cursor(position.partition, |cursor| cursor.resolve(position.offset))
    }

    /// Current commit point of `partition`.
    #[must_use]
    pub fn committed(&self, partition: PartitionId) -> Option<u64> {
        self.with_cursor(partition, |cursor| cursor.committed)
    }

    /// Lowest registered offset still waiting for an outcome.
    #[must_use]
    pub fn lowest_unresolved(&self, partition: PartitionId) -> Option<u64> {
        self.with_cursor(partition, |cursor| cursor.lowest_unresolved())
    }

    /// Number of registered, unresolved offsets across all partitions.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let partitions: Vec<_> = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        partitions
            .iter()
            .map(|cursor| {
                let guard = cursor.lock().unwrap_or_else(PoisonError::into_inner);
                guard.outstanding.values().filter(|resolved| !**resolved).count()
            })
            .sum()
    }

    /// Commit point of every partition that has one.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<PartitionId, u64> {
        let partitions = self.partitions.read().unwrap_or_else(PoisonError::into_inner);
        partitions
            .iter()
            .filter_map(|(id, cursor)| {
                let guard = cursor.lock().unwrap_or_else(PoisonError::into_inner);
                guard.committed.map(|offset| (*id, offset))
            })
            .collect()
    }

    /// Partitions whose commit point advanced since the previous call.
    #[must_use]
    pub fn take_pending_commits(&self) -> BTreeMap<PartitionId, u64> {
        let partitions: Vec<_> = self
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, cursor)| (*id, Arc::clone(cursor)))
            .collect();

        let mut pending = BTreeMap::new();
        for (partition, cursor) in partitions {
            let mut guard = cursor.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.dirty {
                guard.dirty = false;
                if let Some(offset) = guard.committed {
                    pending.insert(partition, offset);
                }
            }
        }
        pending
    }
}
