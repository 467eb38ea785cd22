//! Pipeline YAML configuration types.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};

use crate::validation::rules::{PartitionKeySpec, RuleSpec};

const DEFAULT_MAX_BATCH_RECORDS: usize = 500;
const DEFAULT_MAX_BATCH_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_MAX_BATCH_WINDOW_MS: u64 = 1_000;
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
const DEFAULT_JITTER: f64 = 0.2;
const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;
const DEFAULT_MAX_INFLIGHT_BATCHES: usize = 4;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;
const DEFAULT_PUT_TIMEOUT_MS: u64 = 30_000;

/// Top-level pipeline file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub dlq: DlqConfig,
}

/// Queue the bridge consumes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "use")]
    pub use_ref: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Stream the bridge delivers to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    #[serde(rename = "use")]
    pub use_ref: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Record validation rules and destination partition key selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub partition_key: PartitionKeySpec,
}

/// Bounds on a single destination put.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_max_batch_records", alias = "maxBatchRecords")]
    pub max_batch_records: usize,
    #[serde(
        default = "default_max_batch_bytes",
        alias = "maxBatchBytes",
        deserialize_with = "deserialize_byte_size"
    )]
    pub max_batch_bytes: usize,
    #[serde(default = "default_max_batch_window_ms", alias = "maxBatchWindowMs")]
    pub max_batch_window_ms: u64,
}

impl BatchingConfig {
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.max_batch_window_ms)
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_records: DEFAULT_MAX_BATCH_RECORDS,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_batch_window_ms: DEFAULT_MAX_BATCH_WINDOW_MS,
        }
    }
}

fn default_max_batch_records() -> usize {
    DEFAULT_MAX_BATCH_RECORDS
}
fn default_max_batch_bytes() -> usize {
    DEFAULT_MAX_BATCH_BYTES
}
fn default_max_batch_window_ms() -> u64 {
    DEFAULT_MAX_BATCH_WINDOW_MS
}

/// Partial-failure retry budget and backoff curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retry_attempts", alias = "maxRetryAttempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_backoff_ms", alias = "initialBackoffMs")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier", alias = "backoffMultiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms", alias = "maxBackoffMs")]
    pub max_backoff_ms: u64,
    /// Fraction of each delay that may be shaved off at random.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            jitter: DEFAULT_JITTER,
        }
    }
}

fn default_max_retry_attempts() -> u32 {
    DEFAULT_MAX_RETRY_ATTEMPTS
}
fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}
fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}
fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}
fn default_jitter() -> f64 {
    DEFAULT_JITTER
}

/// Channel capacities and wait bounds between pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Capacity of the raw-message and event channels.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Capacity of the batch channel feeding delivery.
    #[serde(default = "default_max_inflight_batches")]
    pub max_inflight_batches: usize,
    /// Longest a single queue poll may block.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Longest a single destination put may take before it counts as a network failure.
    #[serde(default = "default_put_timeout_ms")]
    pub put_timeout_ms: u64,
}

impl ResourceConfig {
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    #[must_use]
    pub fn put_timeout(&self) -> Duration {
        Duration::from_millis(self.put_timeout_ms)
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_inflight_batches: DEFAULT_MAX_INFLIGHT_BATCHES,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            put_timeout_ms: DEFAULT_PUT_TIMEOUT_MS,
        }
    }
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}
fn default_max_inflight_batches() -> usize {
    DEFAULT_MAX_INFLIGHT_BATCHES
}
fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}
fn default_put_timeout_ms() -> u64 {
    DEFAULT_PUT_TIMEOUT_MS
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
    /// In-memory `SQLite`; state is lost when the process exits.
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    /// Database path for the `sqlite` backend.
    pub connection: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Persist rejected and terminally failed records to the state backend.
    #[serde(default)]
    pub enabled: bool,
}

/// Parse a human byte size such as `"5mb"`, `"512 KiB"` or `"1048576"`.
///
/// # Errors
///
/// Returns an error for unknown units, non-numeric values, or overflow.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let trimmed = input.trim().to_ascii_lowercase();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    if digits.is_empty() {
        bail!("invalid byte size '{input}': missing number");
    }
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid byte size '{input}'"))?;
    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "kb" | "kib" | "k" => 1024,
        "mb" | "mib" | "m" => 1024 * 1024,
        "gb" | "gib" | "g" => 1024 * 1024 * 1024,
        other => bail!("invalid byte size '{input}': unknown unit '{other}'"),
    };
    value
        .checked_mul(multiplier)
        .with_context(|| format!("byte size '{input}' overflows"))
}

fn deserialize_byte_size<'de, D>(deserializer: D) -> std::result::Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    let bytes = match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(text) => parse_byte_size(&text).map_err(serde::de::Error::custom)?,
    };
    usize::try_from(bytes).map_err(serde::de::Error::custom)
}
