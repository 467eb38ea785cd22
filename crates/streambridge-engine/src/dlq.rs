//! Dead-letter collection and persistence used by the orchestrator.

use streambridge_state::StateBackend;
use streambridge_types::envelope::{DlqRecord, Timestamp};
use streambridge_types::error::{FailureReason, Rejection};
use streambridge_types::message::{DomainEvent, RawMessage};
use streambridge_types::state::PipelineId;

/// Dead-letter entry for a message that failed validation.
#[must_use]
pub fn rejected_record(message: &RawMessage, rejection: &Rejection) -> DlqRecord {
    DlqRecord {
        partition: message.partition,
        offset: message.offset,
        record_json: String::from_utf8_lossy(&message.payload).into_owned(),
        error_message: rejection.reasons.join("; "),
        error_category: rejection.kind.category(),
        failed_at: Timestamp::now(),
    }
}

/// Dead-letter entry for an event that failed terminally at the destination.
#[must_use]
pub fn failed_record(event: &DomainEvent, reason: &FailureReason) -> DlqRecord {
    let position = event.position();
    DlqRecord {
        partition: position.partition,
        offset: position.offset,
        record_json: String::from_utf8_lossy(event.data()).into_owned(),
        error_message: format!("{}: {}", reason.code, reason.message),
        error_category: reason.category,
        failed_at: Timestamp::now(),
    }
}

/// Persist collected DLQ records to the state backend.
///
/// Failures are logged, never propagated; losing a dead-letter copy must not
/// stop delivery.
pub(crate) fn persist_dlq_records(
    state_backend: &dyn StateBackend,
    pipeline: &PipelineId,
    run_id: i64,
    records: &[DlqRecord],
) {
    if records.is_empty() {
        return;
    }

    let dlq_count = records.len();

    match state_backend.insert_dlq_records(pipeline, run_id, records) {
        Ok(inserted) => {
            tracing::info!(
                pipeline = pipeline.as_str(),
                dlq_records = inserted,
                "Persisted DLQ records to state backend"
            );
        }
        Err(e) => {
            tracing::error!(
                pipeline = pipeline.as_str(),
                dlq_count,
                error = %e,
                "Failed to persist DLQ records"
            );
        }
    }
}
