//! Shared streambridge data model.
//!
//! Pure data types exchanged between the pipeline engine, the state
//! backend, and the adapters for the source queue and the destination
//! stream. Kept free of async runtime dependencies so every crate in the
//! workspace can share them.

pub mod batch;
pub mod envelope;
pub mod error;
pub mod message;
pub mod outcome;
pub mod state;
