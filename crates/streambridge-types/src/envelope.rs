//! Dead-letter records.
//!
//! [`DlqRecord`] captures a message that will never reach the destination
//! (rejected by validation, refused as malformed, or escalated after the
//! retry budget) so an operator can inspect it later.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;
use crate::state::PartitionId;

/// ISO-8601 formatted timestamp string.
///
/// Thin wrapper providing type clarity; callers are trusted to provide
/// valid ISO-8601 strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(String);

impl Timestamp {
    #[must_use]
    pub fn new(iso8601: impl Into<String>) -> Self {
        Self(iso8601.into())
    }

    #[must_use]
    pub fn now() -> Self {
        Self(chrono::Utc::now().to_rfc3339())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A record that failed terminally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqRecord {
    pub partition: PartitionId,
    pub offset: u64,
    /// Record content; the raw payload (lossy UTF-8) for rejected messages.
    pub record_json: String,
    pub error_message: String,
    pub error_category: ErrorCategory,
    pub failed_at: Timestamp,
}
