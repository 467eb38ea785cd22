//! Structured failure model for validation and delivery.
//!
//! [`FailureReason`] carries the classification of a per-record delivery
//! failure. [`Rejection`] describes why a source message never became a
//! [`DomainEvent`](crate::message::DomainEvent).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::message::SourcePosition;

/// Broad classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Payload could not be decoded.
    Decode,
    /// Decoded payload does not have the expected shape.
    Schema,
    /// A refinement constraint (range, pattern, non-empty) failed.
    Constraint,
    /// Destination throttled the request (retryable).
    Throttled,
    /// Transient destination service error (retryable).
    Transient,
    /// Connection-level failure (retryable).
    Network,
    /// Destination rejected the record as malformed.
    Malformed,
    /// Credentials rejected by the destination.
    Auth,
    /// Destination stream does not exist.
    NotFound,
    /// Retry budget spent while the record was still failing.
    RetriesExhausted,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Decode => "decode",
            Self::Schema => "schema",
            Self::Constraint => "constraint",
            Self::Throttled => "throttled",
            Self::Transient => "transient",
            Self::Network => "network",
            Self::Malformed => "malformed",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Why a record failed to reach the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {code}: {message}")]
pub struct FailureReason {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
}

impl FailureReason {
    #[must_use]
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn throttled(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Throttled, code, message)
    }

    #[must_use]
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, code, message)
    }

    #[must_use]
    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, code, message)
    }

    #[must_use]
    pub fn malformed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Malformed, code, message)
    }

    /// Escalation of a record that was still retryable when the budget ran out.
    #[must_use]
    pub fn retries_exhausted(attempts: u32, last: &FailureReason) -> Self {
        Self::new(
            ErrorCategory::RetriesExhausted,
            "RETRIES_EXHAUSTED",
            format!("gave up after {attempts} attempt(s); last error: {last}"),
        )
    }
}

/// Stage of validation that rejected a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Decode,
    Schema,
    Constraint,
}

impl RejectionKind {
    #[must_use]
    pub fn category(self) -> ErrorCategory {
        match self {
            Self::Decode => ErrorCategory::Decode,
            Self::Schema => ErrorCategory::Schema,
            Self::Constraint => ErrorCategory::Constraint,
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.category(), f)
    }
}

/// A source message that failed validation.
///
/// Keeps the source position so the rejected offset can still be resolved
/// and committed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message {position} rejected ({kind}): {}", .reasons.join("; "))]
pub struct Rejection {
    pub position: SourcePosition,
    pub kind: RejectionKind,
    pub reasons: Vec<String>,
}

impl Rejection {
    #[must_use]
    pub fn new(position: SourcePosition, kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            position,
            kind,
            reasons: vec![reason.into()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_display() {
        let reason = FailureReason::throttled("ThrottlingException", "slow down");
        assert_eq!(reason.to_string(), "[throttled] ThrottlingException: slow down");
    }

    #[test]
    fn test_retries_exhausted_mentions_last_error() {
        let last = FailureReason::transient("InternalFailure", "boom");
        let escalated = FailureReason::retries_exhausted(4, &last);
        assert_eq!(escalated.category, ErrorCategory::RetriesExhausted);
        assert!(escalated.message.contains("4 attempt(s)"));
        assert!(escalated.message.contains("InternalFailure"));
    }

    #[test]
    fn test_rejection_lists_every_reason() {
        let rejection = Rejection {
            position: SourcePosition::new(0, 3),
            kind: RejectionKind::Constraint,
            reasons: vec!["a failed".into(), "b failed".into()],
        };
        let msg = rejection.to_string();
        assert!(msg.contains("0@3"));
        assert!(msg.contains("constraint"));
        assert!(msg.contains("a failed; b failed"));
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorCategory::RetriesExhausted).unwrap();
        assert_eq!(json, "\"retries_exhausted\"");
    }
}
