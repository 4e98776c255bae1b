//! Error types for work distribution.

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::WorkerId;

/// Errors raised while launching workers or coordinating them.
///
/// None of these are retried. Any of them aborts the distributed run; keys
/// that were not returned stay missing and are picked up by the next run.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The coordination endpoint could not be bound.
    #[error("cannot bind coordination server to {addr}: {source}")]
    Bind {
        /// The requested address.
        addr: SocketAddr,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A socket or pipe operation failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A frame could not be encoded or decoded.
    #[error("malformed frame: {reason}")]
    Frame {
        /// Description of the problem.
        reason: String,
    },

    /// The worker launch template is unusable.
    #[error("invalid worker command {template:?}: {reason}")]
    InvalidCommand {
        /// The offending template.
        template: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A worker or remote shell process could not be started.
    #[error("cannot start {command:?} for host {host}: {source}")]
    Spawn {
        /// Host the process was meant for.
        host: String,
        /// The command line.
        command: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A worker did not print its readiness markers in time.
    #[error("worker {id} on {host} did not become ready within {waited:?}")]
    LaunchTimeout {
        /// The worker that stalled.
        id: WorkerId,
        /// Its host.
        host: String,
        /// How long the supervisor waited.
        waited: Duration,
    },

    /// A worker's output ended before it became ready.
    #[error("worker {id} on {host} exited before becoming ready")]
    WorkerExited {
        /// The worker that exited.
        id: WorkerId,
        /// Its host.
        host: String,
    },

    /// A worker did not return its results before the deadline.
    #[error("worker {id} returned no results within {waited:?}")]
    WorkerTimeout {
        /// The worker that missed the deadline.
        id: WorkerId,
        /// The deadline that elapsed.
        waited: Duration,
    },

    /// The run was cancelled by an interrupt.
    #[error("interrupted")]
    Interrupted,

    /// The server refused a worker request.
    #[error("request rejected by server: {reason}")]
    Rejected {
        /// The server's explanation.
        reason: String,
    },

    /// A peer answered with a reply that does not fit the request.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// Description of the mismatch.
        reason: String,
    },
}

impl DispatchError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}
