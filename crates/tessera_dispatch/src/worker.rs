//! The worker side of the protocol.
//!
//! Workers are plain blocking programs: one short TCP connection per
//! exchange, no runtime.

use std::collections::BTreeMap;
use std::io::Write;
use std::marker::PhantomData;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_common::{CacheKey, Compute};

use crate::error::DispatchError;
use crate::frame::{read_frame, write_frame};
use crate::protocol::{
    decode_value, Message, Reply, Resource, Subject, WorkerId, CONNECT_MARKER, STDERR_MARKER,
};

/// Minimum time between two progress messages.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Connection to the coordination server, typed by the round's item, value
/// and descriptor types.
#[derive(Debug, Clone)]
pub struct WorkerClient<I, V, D> {
    id: WorkerId,
    server: String,
    _types: PhantomData<fn() -> (I, V, D)>,
}

impl<I, V, D> WorkerClient<I, V, D>
where
    I: DeserializeOwned,
    V: Serialize,
    D: DeserializeOwned,
{
    /// A client for worker `id` of the server at `server` (`host:port`).
    pub fn new(id: WorkerId, server: impl Into<String>) -> Self {
        Self {
            id,
            server: server.into(),
            _types: PhantomData,
        }
    }

    /// This worker's id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    fn exchange(&self, subject: Subject<V>) -> Result<Reply<I, D>, DispatchError> {
        let mut stream = TcpStream::connect(&self.server)
            .map_err(DispatchError::io(format!("connecting to {}", self.server)))?;
        write_frame(
            &mut stream,
            &Message {
                id: self.id,
                subject,
            },
        )?;
        match read_frame(&mut stream)? {
            Some(Reply::Reject(reason)) => Err(DispatchError::Rejected { reason }),
            Some(reply) => Ok(reply),
            None => Err(DispatchError::protocol("server closed the connection without replying")),
        }
    }

    /// Announces this worker and returns the computation descriptor.
    pub fn purpose(&self) -> Result<D, DispatchError> {
        match self.exchange(Subject::Purpose)? {
            Reply::Purpose(descriptor) => Ok(descriptor),
            _ => Err(DispatchError::protocol("expected a descriptor")),
        }
    }

    /// Fetches the items of this worker's keys.
    pub fn items(&self) -> Result<BTreeMap<CacheKey, I>, DispatchError> {
        match self.exchange(Subject::Request(Resource::Items))? {
            Reply::Items(items) => Ok(items),
            _ => Err(DispatchError::protocol("expected items")),
        }
    }

    /// Fetches the keyed resource `name` for this worker's keys.
    pub fn keyed<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<BTreeMap<CacheKey, T>, DispatchError> {
        match self.exchange(Subject::Request(Resource::Keyed(name.to_string())))? {
            Reply::Keyed(encoded) => encoded
                .into_iter()
                .map(|(key, bytes)| Ok::<_, DispatchError>((key, decode_value(&bytes)?)))
                .collect(),
            _ => Err(DispatchError::protocol("expected a keyed resource")),
        }
    }

    /// Fetches the global resource `name`.
    pub fn global<T: DeserializeOwned>(&self, name: &str) -> Result<T, DispatchError> {
        match self.exchange(Subject::Request(Resource::Global(name.to_string())))? {
            Reply::Global(bytes) => decode_value(&bytes),
            _ => Err(DispatchError::protocol("expected a global resource")),
        }
    }

    /// Sends a progress line to the server's log.
    pub fn info(&self, text: impl Into<String>) -> Result<(), DispatchError> {
        self.expect_ack(Subject::Info(text.into()))
    }

    /// Sends the finished values. The server expects this exactly once.
    pub fn finish(&self, values: BTreeMap<CacheKey, V>) -> Result<(), DispatchError> {
        self.expect_ack(Subject::Result(values))
    }

    fn expect_ack(&self, subject: Subject<V>) -> Result<(), DispatchError> {
        match self.exchange(subject)? {
            Reply::Ack => Ok(()),
            _ => Err(DispatchError::protocol("expected an acknowledgement")),
        }
    }
}

/// Prints the readiness markers around `details`.
///
/// After this returns, the worker must write nothing more to `out`.
pub fn announce_ready<W: Write>(out: &mut W, details: &[String]) -> std::io::Result<()> {
    writeln!(out, "{CONNECT_MARKER}")?;
    for line in details {
        writeln!(out, "{line}")?;
    }
    writeln!(out, "{STDERR_MARKER}")?;
    out.flush()
}

/// What a worker did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    /// Values computed and returned.
    pub computed: usize,
    /// Wall time from first contact to the acknowledged result.
    pub elapsed: Duration,
}

/// Runs one worker to completion once its markers are printed: fetch the
/// descriptor and build the computation from it, fetch the items, compute
/// every one, return the values.
pub fn run_worker<C, F>(
    client: &WorkerClient<C::Item, C::Value, C::Descriptor>,
    build: F,
) -> Result<WorkerSummary, DispatchError>
where
    C: Compute,
    F: FnOnce(C::Descriptor) -> Result<C, DispatchError>,
{
    let started = Instant::now();
    let compute = build(client.purpose()?)?;
    let items = client.items()?;
    let total = items.len();
    tracing::debug!(id = client.id(), total, "received items");
    client.info(format!("computing {total} items"))?;

    let mut values = BTreeMap::new();
    let mut last_report = Instant::now();
    for (done, (key, item)) in items.into_iter().enumerate() {
        let value = compute.compute(&item, &key);
        values.insert(key, value);
        if last_report.elapsed() >= PROGRESS_INTERVAL {
            client.info(format!("{} of {total} computed", done + 1))?;
            last_report = Instant::now();
        }
    }

    let computed = values.len();
    client.finish(values)?;
    Ok(WorkerSummary {
        computed,
        elapsed: started.elapsed(),
    })
}
