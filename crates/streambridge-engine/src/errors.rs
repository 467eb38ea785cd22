//! Pipeline error model.

use crate::connector::{DestinationError, SourceError};

/// Systemic failure that halts consumption.
///
/// Per-record failures never become a fault; only problems that would make
/// every subsequent record fail (bad credentials, a missing stream, an
/// unreachable queue) do.
#[derive(Debug, thiserror::Error)]
pub enum PipelineFault {
    #[error("destination fault: {0}")]
    Destination(#[from] DestinationError),
    #[error("source fault: {0}")]
    Source(#[from] SourceError),
}

/// Categorized pipeline error.
///
/// `Fault` is a [`PipelineFault`] raised while running. `Config` covers a
/// pipeline definition that cannot be run. `Infrastructure` wraps opaque
/// host-side errors (state backend, task join failures, channel errors).
#[derive(Debug)]
pub enum PipelineError {
    Fault(PipelineFault),
    Config(String),
    Infrastructure(anyhow::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fault(e) => write!(f, "pipeline fault: {e}"),
            Self::Config(msg) => write!(f, "invalid pipeline configuration: {msg}"),
            Self::Infrastructure(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<anyhow::Error> for PipelineError {
    fn from(e: anyhow::Error) -> Self {
        Self::Infrastructure(e)
    }
}

impl From<PipelineFault> for PipelineError {
    fn from(fault: PipelineFault) -> Self {
        Self::Fault(fault)
    }
}

impl PipelineError {
    /// Returns `true` for a systemic fault raised while running.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }

    #[must_use]
    pub fn as_fault(&self) -> Option<&PipelineFault> {
        match self {
            Self::Fault(fault) => Some(fault),
            Self::Config(_) | Self::Infrastructure(_) => None,
        }
    }
}
