//! Bridge state persistence.
//!
//! Provides the [`StateBackend`] trait and a [`SqliteStateBackend`]
//! implementation for committed source offsets, run history, and
//! dead-letter queue storage.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::StateBackend;
pub use error::StateError;
pub use sqlite::SqliteStateBackend;
