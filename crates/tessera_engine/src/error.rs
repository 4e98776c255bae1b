//! Error types for cache orchestration.

use tessera_dispatch::DispatchError;
use tessera_store::StoreError;

/// Errors that can occur while bringing the store up to date.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The record store failed. Passed through unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Distributing the work failed. There is no fallback to serial.
    #[error("distributed run failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// The async runtime for the coordination server could not start.
    #[error("cannot start coordination runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// More than one core was requested but no worker command is known.
    #[error("{cores} cores requested but no worker command is configured")]
    NoWorkerCommand {
        /// The requested core count.
        cores: usize,
    },

    /// Serial computation stopped on an interrupt. Values computed before
    /// it are already stored.
    #[error("interrupted after storing {written} records")]
    Interrupted {
        /// Records written before the interrupt.
        written: usize,
    },

    /// Workers finished without returning a value for every assigned key.
    #[error("{missing} assigned keys came back without a value")]
    IncompleteResults {
        /// Keys still without a record.
        missing: usize,
    },
}
