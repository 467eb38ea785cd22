//! Size- and time-bounded batch assembly.

use std::time::Duration;

use streambridge_types::batch::{Batch, BatchId};
use streambridge_types::message::DomainEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::types::BatchingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_records: usize,
    pub max_bytes: usize,
    pub window: Duration,
}

impl BatchLimits {
    #[must_use]
    pub fn from_config(config: &BatchingConfig) -> Self {
        Self {
            max_records: config.max_batch_records.max(1),
            max_bytes: config.max_batch_bytes.max(1),
            window: config.window(),
        }
    }
}

/// Pure batch assembly state; time is supplied by the caller.
///
/// A batch closes when its record count reaches `max_records`, its byte size
/// reaches `max_bytes`, or `window` has elapsed since its first event.
/// Arrival order is kept, so per-partition offset order is too.
#[derive(Debug)]
pub struct Batcher {
    limits: BatchLimits,
    open: Vec<DomainEvent>,
    open_bytes: usize,
    opened_at: Option<Instant>,
    next_id: u64,
}

impl Batcher {
    #[must_use]
    pub fn new(limits: BatchLimits) -> Self {
        Self {
            limits,
            open: Vec::new(),
            open_bytes: 0,
            opened_at: None,
            next_id: 1,
        }
    }

    /// Add an event, returning any batches that closed as a result.
    ///
    /// An event that would push the open batch over the byte cap closes the
    /// open batch first. An event larger than the cap on its own is emitted as
    /// a singleton batch.
    pub fn push(&mut self, event: DomainEvent, now: Instant) -> Vec<Batch> {
        let mut closed = self.poll_expired(now).into_iter().collect::<Vec<_>>();
        let size = event.size_bytes();

        if !self.open.is_empty() && self.open_bytes + size > self.limits.max_bytes {
            closed.extend(self.flush());
        }

        if self.open.is_empty() {
            self.opened_at = Some(now);
        }
        self.open_bytes += size;
        self.open.push(event);

        if self.open.len() >= self.limits.max_records || self.open_bytes >= self.limits.max_bytes {
            closed.extend(self.flush());
        }
        closed
    }

    /// Close the open batch if its window has elapsed.
    pub fn poll_expired(&mut self, now: Instant) -> Option<Batch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    /// Close the open batch regardless of limits.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.open.is_empty() {
            return None;
        }
        let id = BatchId(self.next_id);
        self.next_id += 1;
        self.open_bytes = 0;
        self.opened_at = None;
        Some(Batch::new(id, std::mem::take(&mut self.open)))
    }

    /// When the open batch's window expires, if a batch is open.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|at| at + self.limits.window)
    }

    #[must_use]
    pub fn open_len(&self) -> usize {
        self.open.len()
    }
}

/// Drive a [`Batcher`] from `events` until the channel closes.
///
/// The open batch is flushed on close so shutdown never strands events.
/// Returns the number of batches emitted.
pub async fn run_batch_stage(
    mut events: mpsc::Receiver<DomainEvent>,
    batches: mpsc::Sender<Batch>,
    limits: BatchLimits,
) -> u64 {
    let mut batcher = Batcher::new(limits);
    let mut emitted = 0u64;

    loop {
        let received = match batcher.deadline() {
            Some(deadline) => {
                tokio::select! {
                    event = events.recv() => event,
                    () = tokio::time::sleep_until(deadline) => {
                        if let Some(batch) = batcher.poll_expired(Instant::now()) {
                            if !send_batch(&batches, batch, "window").await {
                                return emitted;
                            }
                            emitted += 1;
                        }
                        continue;
                    }
                }
            }
            None => events.recv().await,
        };

        let Some(event) = received else {
            if let Some(batch) = batcher.flush() {
                if send_batch(&batches, batch, "drain").await {
                    emitted += 1;
                }
            }
            return emitted;
        };

        for batch in batcher.push(event, Instant::now()) {
            if !send_batch(&batches, batch, "limit").await {
                return emitted;
            }
            emitted += 1;
        }
    }
}

async fn send_batch(batches: &mpsc::Sender<Batch>, batch: Batch, trigger: &'static str) -> bool {
    tracing::debug!(
        batch_id = %batch.id,
        records = batch.len(),
        bytes = batch.total_bytes(),
        trigger,
        "Batch closed"
    );
    batches.send(batch).await.is_ok()
}
