//! Core runtime crate for streambridge: validates queue messages, batches
//! them for the destination stream, retries partial failures, and commits
//! source offsets only once every record below them is resolved.

pub mod batcher;
pub mod config;
pub mod connector;
pub mod delivery;
pub mod dlq;
pub mod errors;
pub mod execution;
pub mod local;
pub mod offsets;
pub mod orchestrator;
pub(crate) mod resolve;
pub mod result;
pub mod retry;
pub mod validation;

// Re-export public API for convenience
pub use errors::{PipelineError, PipelineFault};
pub use execution::ExecutionOptions;
pub use orchestrator::{check_pipeline, run_pipeline, run_with_collaborators, Collaborators};
pub use result::{CheckResult, PipelineResult};
