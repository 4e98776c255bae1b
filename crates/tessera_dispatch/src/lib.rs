//! Distributing outstanding computations across worker processes.
//!
//! The orchestrating process [`partition`]s the missing keys, binds a
//! [`CoordinationServer`], [`launch`]es one worker per core slot and serves
//! them until each has returned its values. Workers run the blocking
//! [`run_worker`] loop against the same endpoint.

#![warn(missing_docs)]

pub mod cancel;
pub mod error;
pub mod frame;
pub mod partition;
pub mod protocol;
pub mod server;
pub mod spawner;
pub mod supervisor;
pub mod worker;

pub use cancel::CancelToken;
pub use error::DispatchError;
pub use partition::{partition, partition_with};
pub use protocol::{
    Message, Reply, Resource, SharedResources, Subject, WorkUnit, WorkerId, CONNECT_MARKER,
    STDERR_MARKER,
};
pub use server::{CoordinationServer, Job, ServeOptions};
pub use spawner::{LocalSpawner, RemoteSpawner, Session, Spawner};
pub use supervisor::{is_local_host, launch, LaunchPlan, Spawners, WorkerCommand, WorkerPool};
pub use worker::{announce_ready, run_worker, WorkerClient, WorkerSummary};
