//! Keeping a fingerprint store complete.
//!
//! [`CacheOrchestrator::ensure`] hashes a dataset, works out which keys the
//! store lacks and computes exactly those, either in this process or across
//! a pool of worker processes.

#![warn(missing_docs)]

pub mod error;
pub mod orchestrator;

pub use error::EngineError;
pub use orchestrator::{CacheOrchestrator, EnsureMode, EnsureReport, Parallelism};
