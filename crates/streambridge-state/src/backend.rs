//! State backend trait definition.
//!
//! [`StateBackend`] defines the storage contract for committed source
//! offsets, run history, and dead-letter queue records. Model types live
//! in [`streambridge_types::state`].

use streambridge_types::envelope::DlqRecord;
use streambridge_types::state::{CommittedOffset, PartitionId, PipelineId, RunStats, RunStatus};

use crate::error;

/// Storage contract for bridge state.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn StateBackend>`.
pub trait StateBackend: Send + Sync {
    /// Read every committed partition offset for a pipeline, ordered by partition.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn committed_offsets(&self, pipeline: &PipelineId) -> error::Result<Vec<CommittedOffset>>;

    /// Record `offset` as the commit point of `partition`.
    ///
    /// Commit points only move forward: returns `false` without writing when
    /// the stored offset is already at or beyond `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn commit_offset(
        &self,
        pipeline: &PipelineId,
        partition: PartitionId,
        offset: u64,
    ) -> error::Result<bool>;

    /// Begin a new bridge run, returning its unique ID.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64>;

    /// Finalize a run with status and aggregate stats.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()>;

    /// Persist dead-letter queue records. Returns the count inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn insert_dlq_records(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[DlqRecord],
    ) -> error::Result<u64>;
}
