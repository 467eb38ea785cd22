//! Delivery client adapter: one destination put, classified per record.
//!
//! The adapter never retries. It turns whatever the destination returned into
//! exactly one [`DeliveryOutcome`] per submitted event, in submission order.

use std::sync::Arc;
use std::time::Duration;

use streambridge_types::error::{ErrorCategory, FailureReason};
use streambridge_types::message::DomainEvent;
use streambridge_types::outcome::DeliveryOutcome;

use crate::connector::{
    DestinationError, DestinationErrorKind, DestinationStream, PutRecord, PutRecordResult,
};

/// Code of the network error reported when a put outlives its time limit.
pub const PUT_TIMEOUT: &str = "PUT_TIMEOUT";

const DEFAULT_PUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Code attached to records the destination returned no result for.
pub const OUTCOME_MISSING: &str = "OUTCOME_MISSING";

const THROTTLING_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "LimitExceededException",
];

const TRANSIENT_CODES: &[&str] = &["InternalFailure", "ServiceUnavailable", "KMSThrottlingException"];

const MALFORMED_CODES: &[&str] = &[
    "ValidationException",
    "InvalidArgumentException",
    "SerializationException",
    "KMSInvalidStateException",
    "KMSDisabledException",
    "KMSNotFoundException",
    "KMSAccessDeniedException",
];

/// Per-record outcomes of one put, plus the whole-request error if there was one.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub outcomes: Vec<DeliveryOutcome>,
    pub batch_error: Option<DestinationError>,
}

impl DeliveryReport {
    #[must_use]
    pub fn retryable_indices(&self) -> Vec<usize> {
        self.indices_where(DeliveryOutcome::is_retryable)
    }

    #[must_use]
    pub fn fatal_indices(&self) -> Vec<usize> {
        self.indices_where(|o| matches!(o, DeliveryOutcome::FatalFailure { .. }))
    }

    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_delivered()).count()
    }

    fn indices_where(&self, predicate: impl Fn(&DeliveryOutcome) -> bool) -> Vec<usize> {
        self.outcomes
            .iter()
            .enumerate()
            .filter(|(_, outcome)| predicate(outcome))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Classify a per-record destination error code.
///
/// Unknown codes are treated as retryable; the retry budget bounds them.
#[must_use]
pub fn classify_error_code(code: &str, message: &str) -> DeliveryOutcome {
    if THROTTLING_CODES.contains(&code) {
        DeliveryOutcome::retryable(FailureReason::throttled(code, message))
    } else if TRANSIENT_CODES.contains(&code) {
        DeliveryOutcome::retryable(FailureReason::transient(code, message))
    } else if MALFORMED_CODES.contains(&code) {
        DeliveryOutcome::fatal(FailureReason::malformed(code, message))
    } else {
        DeliveryOutcome::retryable(FailureReason::new(ErrorCategory::Internal, code, message))
    }
}

/// Map a whole-request error onto every record, or `None` when it is systemic.
fn classify_batch_error(error: &DestinationError) -> Option<DeliveryOutcome> {
    let reason = |category| FailureReason::new(category, error.code.clone(), error.message.clone());
    match error.kind {
        DestinationErrorKind::Throttled => {
            Some(DeliveryOutcome::retryable(reason(ErrorCategory::Throttled)))
        }
        DestinationErrorKind::Transient => {
            Some(DeliveryOutcome::retryable(reason(ErrorCategory::Transient)))
        }
        DestinationErrorKind::Network => {
            Some(DeliveryOutcome::retryable(reason(ErrorCategory::Network)))
        }
        DestinationErrorKind::Internal => {
            Some(DeliveryOutcome::retryable(reason(ErrorCategory::Internal)))
        }
        DestinationErrorKind::Malformed => {
            Some(DeliveryOutcome::fatal(reason(ErrorCategory::Malformed)))
        }
        DestinationErrorKind::Auth | DestinationErrorKind::NotFound => None,
    }
}

/// Wraps a [`DestinationStream`] and classifies its results.
#[derive(Clone)]
pub struct DeliveryClient {
    destination: Arc<dyn DestinationStream>,
    put_timeout: Duration,
}

impl DeliveryClient {
    #[must_use]
    pub fn new(destination: Arc<dyn DestinationStream>) -> Self {
        Self {
            destination,
            put_timeout: DEFAULT_PUT_TIMEOUT,
        }
    }

    /// Bound every put by `put_timeout`; an elapsed put fails the whole request as a network error.
    #[must_use]
    pub fn with_put_timeout(mut self, put_timeout: Duration) -> Self {
        self.put_timeout = put_timeout;
        self
    }

    async fn put_with_timeout(
        &self,
        records: &[PutRecord],
    ) -> Result<Vec<PutRecordResult>, DestinationError> {
        match tokio::time::timeout(self.put_timeout, self.destination.put_batch(records)).await {
            Ok(result) => result,
            Err(_) => Err(DestinationError::new(
                DestinationErrorKind::Network,
                PUT_TIMEOUT,
                format!("put did not complete within {}ms", self.put_timeout.as_millis()),
            )),
        }
    }

    /// Submit `events` in one put and classify the response.
    ///
    /// # Errors
    ///
    /// Returns the destination error unchanged when it is systemic
    /// (authentication or missing stream); the caller must stop the pipeline.
    pub async fn deliver(&self, events: &[&DomainEvent]) -> Result<DeliveryReport, DestinationError> {
        if events.is_empty() {
            return Ok(DeliveryReport {
                outcomes: Vec::new(),
                batch_error: None,
            });
        }

        let records: Vec<PutRecord> = events
            .iter()
            .map(|event| PutRecord {
                partition_key: event.partition_key().to_string(),
                data: event.data().clone(),
            })
            .collect();

        match self.put_with_timeout(&records).await {
            Ok(results) => Ok(classify_results(results, records.len())),
            Err(error) => {
                let Some(outcome) = classify_batch_error(&error) else {
                    tracing::error!(
                        kind = %error.kind,
                        code = %error.code,
                        "Destination rejected the request: {}",
                        error.message
                    );
                    return Err(error);
                };
                tracing::warn!(
                    kind = %error.kind,
                    code = %error.code,
                    records = records.len(),
                    "Put request failed as a whole: {}",
                    error.message
                );
                Ok(DeliveryReport {
                    outcomes: vec![outcome; records.len()],
                    batch_error: Some(error),
                })
            }
        }
    }
}

fn classify_results(results: Vec<PutRecordResult>, expected: usize) -> DeliveryReport {
    if results.len() < expected {
        tracing::warn!(
            expected,
            received = results.len(),
            "Destination returned fewer results than records; missing ones will be retried"
        );
    }

    let mut outcomes: Vec<DeliveryOutcome> = results
        .into_iter()
        .take(expected)
        .map(|result| match result {
            PutRecordResult::Ok { .. } => DeliveryOutcome::Delivered,
            PutRecordResult::Err {
                error_code,
                error_message,
            } => classify_error_code(&error_code, &error_message),
        })
        .collect();

    let missing = DeliveryOutcome::retryable(FailureReason::new(
        ErrorCategory::Internal,
        OUTCOME_MISSING,
        "destination returned no result for this record",
    ));
    outcomes.resize(expected, missing);

    DeliveryReport {
        outcomes,
        batch_error: None,
    }
}
