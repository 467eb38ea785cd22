//! `SQLite`-backed implementation of [`StateBackend`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Offset commits are
//! infrequent (one per advanced partition per resolved batch) so the lock
//! is never on the per-record path.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDateTime, Utc};
use rusqlite::Connection;
use streambridge_types::envelope::DlqRecord;
use streambridge_types::state::{CommittedOffset, PartitionId, PipelineId, RunStats, RunStatus};

use crate::backend::StateBackend;
use crate::error::{self, StateError};

/// `SQLite` datetime format (UTC, no timezone suffix).
const SQLITE_DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Idempotent DDL for state tables.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS committed_offsets (
    pipeline TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    committed_offset INTEGER NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (pipeline, partition_id)
);

CREATE TABLE IF NOT EXISTS bridge_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL DEFAULT (datetime('now')),
    finished_at TEXT,
    records_polled INTEGER DEFAULT 0,
    records_delivered INTEGER DEFAULT 0,
    records_failed INTEGER DEFAULT 0,
    records_rejected INTEGER DEFAULT 0,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS dlq_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    run_id INTEGER NOT NULL REFERENCES bridge_runs(id),
    partition_id INTEGER NOT NULL,
    source_offset INTEGER NOT NULL,
    record_json TEXT NOT NULL,
    error_message TEXT NOT NULL,
    error_category TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_dlq_pipeline_run ON dlq_records (pipeline, run_id);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| StateError::backend_context("open", e))?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(|e| StateError::backend_context("create tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Format current UTC time for `SQLite` storage.
    fn now_sqlite() -> String {
        Utc::now().format(SQLITE_DATETIME_FMT).to_string()
    }

    /// Convert a `SQLite` datetime string to ISO-8601.
    fn sqlite_to_iso8601(raw: &str) -> String {
        NaiveDateTime::parse_from_str(raw, SQLITE_DATETIME_FMT).map_or_else(
            |_| raw.to_string(),
            |ndt| format!("{}Z", ndt.format("%Y-%m-%dT%H:%M:%S")),
        )
    }

    fn to_stored_offset(offset: u64) -> error::Result<i64> {
        i64::try_from(offset).map_err(|_| StateError::OffsetOutOfRange(offset))
    }

    fn from_stored_offset(stored: i64) -> error::Result<u64> {
        u64::try_from(stored).map_err(|_| StateError::NegativeOffset(stored))
    }

    #[cfg(test)]
    fn get_run_row(
        &self,
        run_id: i64,
    ) -> error::Result<(String, i64, Option<String>, Option<String>)> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT status, records_polled, finished_at, error_message FROM bridge_runs WHERE id = ?1",
            [run_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(StateError::backend)
    }

    #[cfg(test)]
    fn count_dlq_records_for_run(&self, pipeline: &PipelineId, run_id: i64) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT COUNT(*) FROM dlq_records WHERE pipeline = ?1 AND run_id = ?2",
            rusqlite::params![pipeline.as_str(), run_id],
            |row| row.get(0),
        )
        .map_err(StateError::backend)
    }
}

impl StateBackend for SqliteStateBackend {
    fn committed_offsets(&self, pipeline: &PipelineId) -> error::Result<Vec<CommittedOffset>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT partition_id, committed_offset, updated_at \
                 FROM committed_offsets WHERE pipeline = ?1 ORDER BY partition_id",
            )
            .map_err(|e| StateError::backend_context("committed_offsets: prepare", e))?;

        let rows = stmt
            .query_map(rusqlite::params![pipeline.as_str()], |row| {
                let partition: i32 = row.get(0)?;
                let offset: i64 = row.get(1)?;
                let updated_at: String = row.get(2)?;
                Ok((partition, offset, updated_at))
            })
            .map_err(|e| StateError::backend_context("committed_offsets: query", e))?;

        let mut offsets = Vec::new();
        for row in rows {
            let (partition, offset, updated_at) =
                row.map_err(|e| StateError::backend_context("committed_offsets: row", e))?;
            offsets.push(CommittedOffset {
                partition: PartitionId::new(partition),
                offset: Self::from_stored_offset(offset)?,
                updated_at: Self::sqlite_to_iso8601(&updated_at),
            });
        }
        Ok(offsets)
    }

    fn commit_offset(
        &self,
        pipeline: &PipelineId,
        partition: PartitionId,
        offset: u64,
    ) -> error::Result<bool> {
        let stored = Self::to_stored_offset(offset)?;
        let conn = self.lock_conn()?;
        let rows_affected = conn
            .execute(
                "INSERT INTO committed_offsets (pipeline, partition_id, committed_offset, updated_at) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(pipeline, partition_id) \
                 DO UPDATE SET committed_offset = excluded.committed_offset, \
                               updated_at = excluded.updated_at \
                 WHERE excluded.committed_offset > committed_offsets.committed_offset",
                rusqlite::params![pipeline.as_str(), partition.get(), stored, Self::now_sqlite()],
            )
            .map_err(|e| StateError::backend_context("commit_offset", e))?;
        Ok(rows_affected > 0)
    }

    fn start_run(&self, pipeline: &PipelineId) -> error::Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO bridge_runs (pipeline, status) VALUES (?1, ?2)",
            rusqlite::params![pipeline.as_str(), RunStatus::Running.as_str()],
        )
        .map_err(|e| StateError::backend_context("start_run", e))?;
        Ok(conn.last_insert_rowid())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn complete_run(&self, run_id: i64, status: RunStatus, stats: &RunStats) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE bridge_runs SET status = ?1, finished_at = datetime('now'), \
             records_polled = ?2, records_delivered = ?3, records_failed = ?4, \
             records_rejected = ?5, error_message = ?6 \
             WHERE id = ?7",
            rusqlite::params![
                status.as_str(),
                stats.records_polled as i64,
                stats.records_delivered as i64,
                stats.records_failed as i64,
                stats.records_rejected as i64,
                stats.error_message,
                run_id,
            ],
        )
        .map_err(|e| StateError::backend_context("complete_run", e))?;
        Ok(())
    }

    fn insert_dlq_records(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[DlqRecord],
    ) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StateError::backend_context("insert_dlq_records: begin tx", e))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO dlq_records \
                 (pipeline, run_id, partition_id, source_offset, record_json, error_message, \
                  error_category, failed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .map_err(|e| StateError::backend_context("insert_dlq_records: prepare", e))?;

        let mut count = 0u64;
        for record in records {
            stmt.execute(rusqlite::params![
                pipeline.as_str(),
                run_id,
                record.partition.get(),
                Self::to_stored_offset(record.offset)?,
                record.record_json,
                record.error_message,
                record.error_category.to_string(),
                record.failed_at.as_str(),
            ])
            .map_err(|e| StateError::backend_context("insert_dlq_records: execute", e))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(|e| StateError::backend_context("insert_dlq_records: commit", e))?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streambridge_types::envelope::Timestamp;
    use streambridge_types::error::ErrorCategory;

    fn pid(name: &str) -> PipelineId {
        PipelineId::new(name)
    }

    fn dlq(partition: i32, offset: u64, message: &str) -> DlqRecord {
        DlqRecord {
            partition: PartitionId::new(partition),
            offset,
            record_json: r#"{"id":1}"#.into(),
            error_message: message.into(),
            error_category: ErrorCategory::Constraint,
            failed_at: Timestamp::new("2026-02-21T12:00:00+00:00"),
        }
    }

    #[test]
    fn test_offsets_empty_for_new_pipeline() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert!(backend.committed_offsets(&pid("p")).unwrap().is_empty());
    }

    #[test]
    fn test_commit_offset_roundtrip() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert!(backend.commit_offset(&pid("p"), PartitionId::new(1), 10).unwrap());
        assert!(backend.commit_offset(&pid("p"), PartitionId::new(0), 4).unwrap());

        let offsets = backend.committed_offsets(&pid("p")).unwrap();
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets[0].partition, PartitionId::new(0));
        assert_eq!(offsets[0].offset, 4);
        assert_eq!(offsets[1].partition, PartitionId::new(1));
        assert_eq!(offsets[1].offset, 10);
        assert!(offsets[0].updated_at.ends_with('Z'));
    }

    #[test]
    fn test_commit_offset_never_moves_backwards() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert!(backend.commit_offset(&pid("p"), PartitionId::new(0), 50).unwrap());
        assert!(!backend.commit_offset(&pid("p"), PartitionId::new(0), 20).unwrap());
        assert!(!backend.commit_offset(&pid("p"), PartitionId::new(0), 50).unwrap());
        assert!(backend.commit_offset(&pid("p"), PartitionId::new(0), 51).unwrap());

        let offsets = backend.committed_offsets(&pid("p")).unwrap();
        assert_eq!(offsets[0].offset, 51);
    }

    #[test]
    fn test_different_pipelines_independent() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        backend.commit_offset(&pid("a"), PartitionId::new(0), 7).unwrap();
        backend.commit_offset(&pid("b"), PartitionId::new(0), 9).unwrap();

        assert_eq!(backend.committed_offsets(&pid("a")).unwrap()[0].offset, 7);
        assert_eq!(backend.committed_offsets(&pid("b")).unwrap()[0].offset, 9);
    }

    #[test]
    fn test_commit_offset_rejects_unstorable_offset() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let err = backend
            .commit_offset(&pid("p"), PartitionId::new(0), u64::MAX)
            .unwrap_err();
        assert!(matches!(err, StateError::OffsetOutOfRange(u64::MAX)));
    }

    #[test]
    fn test_offsets_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        {
            let backend = SqliteStateBackend::open(&path).unwrap();
            backend.commit_offset(&pid("p"), PartitionId::new(3), 99).unwrap();
        }
        let reopened = SqliteStateBackend::open(&path).unwrap();
        let offsets = reopened.committed_offsets(&pid("p")).unwrap();
        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets[0].offset, 99);
    }

    #[test]
    fn test_run_lifecycle() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.start_run(&pid("p")).unwrap();
        assert!(run_id > 0);

        backend
            .complete_run(
                run_id,
                RunStatus::Completed,
                &RunStats {
                    records_polled: 1000,
                    records_delivered: 990,
                    records_failed: 4,
                    records_rejected: 6,
                    error_message: None,
                },
            )
            .unwrap();

        let (status, records_polled, finished, _error) = backend.get_run_row(run_id).unwrap();
        assert_eq!(status, "completed");
        assert_eq!(records_polled, 1000);
        assert!(finished.is_some());
    }

    #[test]
    fn test_run_failure() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.start_run(&pid("p")).unwrap();

        backend
            .complete_run(
                run_id,
                RunStatus::Failed,
                &RunStats {
                    records_polled: 50,
                    error_message: Some("destination auth rejected".into()),
                    ..RunStats::default()
                },
            )
            .unwrap();

        let (status, _records, _finished, error_msg) = backend.get_run_row(run_id).unwrap();
        assert_eq!(status, "failed");
        assert_eq!(error_msg, Some("destination auth rejected".into()));
    }

    #[test]
    fn test_dlq_records_insert_and_count() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.start_run(&pid("p")).unwrap();

        let records = vec![dlq(0, 3, "empty id"), dlq(1, 8, "value out of range")];
        let count = backend
            .insert_dlq_records(&pid("p"), run_id, &records)
            .unwrap();
        assert_eq!(count, 2);

        let stored = backend.count_dlq_records_for_run(&pid("p"), run_id).unwrap();
        assert_eq!(stored, 2);
    }

    #[test]
    fn test_dlq_records_empty_insert() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let count = backend.insert_dlq_records(&pid("p"), 1, &[]).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_sqlite_to_iso8601_conversion() {
        let iso = SqliteStateBackend::sqlite_to_iso8601("2024-01-15 10:00:00");
        assert_eq!(iso, "2024-01-15T10:00:00Z");
    }
}
