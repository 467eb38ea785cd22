//! Per-record delivery results.

use serde::{Deserialize, Serialize};

use crate::error::FailureReason;

/// Result of submitting one record to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    RetryableFailure { reason: FailureReason },
    FatalFailure { reason: FailureReason },
}

impl DeliveryOutcome {
    #[must_use]
    pub fn retryable(reason: FailureReason) -> Self {
        Self::RetryableFailure { reason }
    }

    #[must_use]
    pub fn fatal(reason: FailureReason) -> Self {
        Self::FatalFailure { reason }
    }

    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableFailure { .. })
    }

    /// Delivered and fatal outcomes need no further work.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }

    #[must_use]
    pub fn reason(&self) -> Option<&FailureReason> {
        match self {
            Self::Delivered => None,
            Self::RetryableFailure { reason } | Self::FatalFailure { reason } => Some(reason),
        }
    }
}
