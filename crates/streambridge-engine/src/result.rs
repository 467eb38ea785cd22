//! Pipeline run and check result types.

use std::collections::BTreeMap;

use serde::Serialize;
use streambridge_types::state::{PartitionId, RunStats};

/// Aggregate record counts for a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounts {
    pub records_polled: u64,
    pub records_rejected: u64,
    pub records_delivered: u64,
    /// Refused by the destination as malformed.
    pub records_fatal: u64,
    /// Still retryable when the retry budget ran out.
    pub records_escalated: u64,
}

/// Delivery-side activity for a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub batches: u64,
    pub put_attempts: u64,
    /// Put attempts beyond the first for each batch.
    pub retries: u64,
    pub offset_commits: u64,
    pub dlq_records: u64,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub counts: PipelineCounts,
    pub delivery: DeliveryStats,
    /// Final commit point per partition.
    pub committed: BTreeMap<PartitionId, u64>,
    pub duration_secs: f64,
}

impl PipelineResult {
    /// Counts in the shape persisted with the run record.
    #[must_use]
    pub fn run_stats(&self) -> RunStats {
        RunStats {
            records_polled: self.counts.records_polled,
            records_delivered: self.counts.records_delivered,
            records_failed: self.counts.records_fatal + self.counts.records_escalated,
            records_rejected: self.counts.records_rejected,
            error_message: None,
        }
    }
}

/// Result of a pipeline check.
#[derive(Debug)]
pub struct CheckResult {
    pub config_ok: bool,
    pub rules_compiled: usize,
    pub source_ok: bool,
    pub destination_ok: bool,
    pub state_ok: bool,
}

impl CheckResult {
    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.config_ok && self.source_ok && self.destination_ok && self.state_ok
    }
}
