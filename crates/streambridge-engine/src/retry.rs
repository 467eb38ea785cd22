//! Retry coordinator: resubmits only the retryable subset of a batch.
//!
//! Each in-flight batch is an explicit state machine:
//!
//! ```text
//! Submitted ─┬─> AllDelivered
//!            └─> PartialFailure ─┬─> Backoff ─> Submitted
//!                                └─> MaxAttemptsExceeded ─> Escalated
//! ```
//!
//! [`InFlightBatch::record_report`] leaves `Submitted`; [`InFlightBatch::advance`]
//! steps every state that needs no I/O. [`deliver_with_retry`] drives the
//! machine and only sleeps in `Backoff`.

use std::time::Duration;

use rand::Rng;
use streambridge_types::batch::{Batch, BatchId};
use streambridge_types::error::FailureReason;
use streambridge_types::message::DomainEvent;
use streambridge_types::outcome::DeliveryOutcome;

use crate::config::types::RetryConfig;
use crate::connector::{DestinationError, DestinationErrorKind};
use crate::delivery::{DeliveryClient, DeliveryReport};

/// Exponential backoff with downward jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_retry_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    pub jitter: f64,
}

impl BackoffPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retry_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.backoff_multiplier,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry `n` (1-based), before jitter:
    /// `min(initial * multiplier^(n-1), max)`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap
    )]
    pub fn base_delay(&self, n: u32) -> Duration {
        let exponent = n.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_ms = self.max_backoff.as_millis() as f64;
        let ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        if !ms.is_finite() || ms >= max_ms {
            return self.max_backoff;
        }
        Duration::from_millis(ms.round() as u64)
    }

    /// Jittered delay, uniformly drawn from `[base * (1 - jitter), base]`.
    #[must_use]
    pub fn delay<R: Rng + ?Sized>(&self, n: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(n);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let low = base.mul_f64(1.0 - self.jitter);
        rng.gen_range(low..=base)
    }
}

/// Where an in-flight batch is in its delivery lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryState {
    /// Pending records are about to be put (attempt is 1-based).
    Submitted { attempt: u32 },
    /// The last put left `retryable` records unresolved.
    PartialFailure { attempt: u32, retryable: usize },
    /// Waiting `delay` before retry number `retry`.
    Backoff { retry: u32, delay: Duration },
    /// The retry budget is spent with records still retryable.
    MaxAttemptsExceeded { attempt: u32 },
    /// No retryable records remain (some may have failed fatally).
    AllDelivered,
    /// Remaining retryable records were escalated to fatal failures.
    Escalated { escalated: usize },
}

impl RetryState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AllDelivered | Self::Escalated { .. })
    }
}

/// One batch moving through submission, backoff and escalation.
#[derive(Debug)]
pub struct InFlightBatch {
    id: BatchId,
    events: Vec<DomainEvent>,
    outcomes: Vec<Option<DeliveryOutcome>>,
    pending: Vec<usize>,
    state: RetryState,
    put_attempts: u32,
    policy: BackoffPolicy,
}

impl InFlightBatch {
    #[must_use]
    pub fn new(batch: Batch, policy: BackoffPolicy) -> Self {
        let len = batch.events.len();
        let state = if len == 0 {
            RetryState::AllDelivered
        } else {
            RetryState::Submitted { attempt: 1 }
        };
        Self {
            id: batch.id,
            events: batch.events,
            outcomes: vec![None; len],
            pending: (0..len).collect(),
            state,
            put_attempts: 0,
            policy,
        }
    }

    #[must_use]
    pub fn id(&self) -> BatchId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> &RetryState {
        &self.state
    }

    /// Events still awaiting a terminal outcome, in original batch order.
    #[must_use]
    pub fn pending_events(&self) -> Vec<&DomainEvent> {
        self.pending.iter().map(|&i| &self.events[i]).collect()
    }

    /// Apply the outcomes of a put of [`Self::pending_events`].
    ///
    /// Only meaningful in `Submitted`; ignored in every other state.
    pub fn record_report(&mut self, report: DeliveryReport) {
        let RetryState::Submitted { attempt } = self.state else {
            return;
        };
        self.put_attempts += 1;

        let submitted = std::mem::take(&mut self.pending);
        for (&index, outcome) in submitted.iter().zip(report.outcomes) {
            if outcome.is_retryable() {
                self.pending.push(index);
            }
            self.outcomes[index] = Some(outcome);
        }

        self.state = if self.pending.is_empty() {
            RetryState::AllDelivered
        } else {
            RetryState::PartialFailure {
                attempt,
                retryable: self.pending.len(),
            }
        };
    }

    /// Step a state that needs no I/O.
    ///
    /// `PartialFailure` becomes `Backoff` while the budget allows another
    /// resubmission, `MaxAttemptsExceeded` otherwise. `Backoff` becomes
    /// `Submitted` and `MaxAttemptsExceeded` becomes `Escalated`.
    pub fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.state = match self.state {
            RetryState::PartialFailure { attempt, .. } => {
                let retries_done = attempt - 1;
                if retries_done < self.policy.max_retry_attempts {
                    let retry = retries_done + 1;
                    RetryState::Backoff {
                        retry,
                        delay: self.policy.delay(retry, rng),
                    }
                } else {
                    RetryState::MaxAttemptsExceeded { attempt }
                }
            }
            RetryState::Backoff { retry, .. } => RetryState::Submitted { attempt: retry + 1 },
            RetryState::MaxAttemptsExceeded { attempt } => {
                let escalated = self.escalate(attempt);
                RetryState::Escalated { escalated }
            }
            ref other => other.clone(),
        };
    }

    fn escalate(&mut self, attempts: u32) -> usize {
        let pending = std::mem::take(&mut self.pending);
        for &index in &pending {
            let last = self.outcomes[index]
                .as_ref()
                .and_then(DeliveryOutcome::reason)
                .cloned()
                .unwrap_or_else(|| {
                    FailureReason::transient("UNKNOWN", "record failed without a reason")
                });
            self.outcomes[index] = Some(DeliveryOutcome::fatal(FailureReason::retries_exhausted(
                attempts, &last,
            )));
        }
        pending.len()
    }

    /// Consume a terminal batch into its events paired with final outcomes.
    ///
    /// Returns `None` while the batch is not terminal.
    #[must_use]
    pub fn into_resolved(self) -> Option<ResolvedBatch> {
        if !self.state.is_terminal() {
            return None;
        }
        let escalated = match self.state {
            RetryState::Escalated { escalated } => escalated,
            _ => 0,
        };
        let records = self
            .events
            .into_iter()
            .zip(self.outcomes)
            .map(|(event, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    DeliveryOutcome::fatal(FailureReason::retries_exhausted(
                        self.put_attempts,
                        &FailureReason::transient("UNKNOWN", "record was never submitted"),
                    ))
                });
                (event, outcome)
            })
            .collect();
        Some(ResolvedBatch {
            id: self.id,
            records,
            put_attempts: self.put_attempts,
            escalated,
        })
    }
}

/// A batch whose every event reached a terminal outcome.
#[derive(Debug)]
pub struct ResolvedBatch {
    pub id: BatchId,
    pub records: Vec<(DomainEvent, DeliveryOutcome)>,
    pub put_attempts: u32,
    pub escalated: usize,
}

impl ResolvedBatch {
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.records.iter().filter(|(_, o)| o.is_delivered()).count()
    }

    /// Fatal outcomes, escalated ones included.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.records.len() - self.delivered()
    }
}

/// Drive `batch` until every event is delivered or terminally failed.
///
/// # Errors
///
/// Returns the destination error when a put fails systemically; the
/// batch is abandoned unresolved and its offsets must not be committed.
pub async fn deliver_with_retry(
    client: &DeliveryClient,
    batch: Batch,
    policy: BackoffPolicy,
) -> Result<ResolvedBatch, DestinationError> {
    let mut in_flight = InFlightBatch::new(batch, policy);
    let batch_id = in_flight.id();

    loop {
        match in_flight.state().clone() {
            RetryState::Submitted { attempt } => {
                let report = client.deliver(&in_flight.pending_events()).await?;
                tracing::debug!(
                    batch_id = %batch_id,
                    attempt,
                    delivered = report.delivered_count(),
                    retryable = report.retryable_indices().len(),
                    fatal = report.fatal_indices().len(),
                    "Put completed"
                );
                in_flight.record_report(report);
            }
            RetryState::Backoff { retry, delay } => {
                tracing::info!(
                    batch_id = %batch_id,
                    attempt = retry + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    records = in_flight.pending_events().len(),
                    "Retrying failed records after backoff"
                );
                tokio::time::sleep(delay).await;
                in_flight.advance(&mut rand::thread_rng());
            }
            RetryState::PartialFailure { .. } | RetryState::MaxAttemptsExceeded { .. } => {
                in_flight.advance(&mut rand::thread_rng());
            }
            RetryState::AllDelivered | RetryState::Escalated { .. } => break,
        }
    }

    let resolved = in_flight.into_resolved().ok_or_else(|| {
        DestinationError::new(
            DestinationErrorKind::Internal,
            "UNRESOLVED_BATCH",
            format!("batch {batch_id} left the retry loop unresolved"),
        )
    })?;
    if resolved.escalated > 0 {
        tracing::error!(
            batch_id = %batch_id,
            escalated = resolved.escalated,
            attempts = resolved.put_attempts,
            "Retry budget exhausted; records escalated to fatal failures"
        );
    }
    Ok(resolved)
}
