//! The coordination server: one endpoint, one message at a time.
//!
//! Workers connect, send one [`Message`] frame, read one [`Reply`] frame and
//! disconnect. The server handles exchanges strictly in arrival order on a
//! single task, and finishes once every worker in the roster has returned
//! its [`Subject::Result`].

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_common::{CacheKey, LogSink};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::error::DispatchError;
use crate::frame::{read_frame_async, write_frame_async};
use crate::protocol::{Message, Reply, Resource, SharedResources, Subject, WorkUnit, WorkerId};

/// How often the loop checks for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(200);

/// How long one exchange may take once a connection is accepted.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the server hands out during one distribution round.
#[derive(Debug)]
pub struct Job<'a, I, D> {
    /// Sent to every worker in answer to [`Subject::Purpose`].
    pub descriptor: D,
    /// Items of every outstanding key.
    pub items: &'a BTreeMap<CacheKey, I>,
    /// One unit per launched worker.
    pub units: &'a [WorkUnit],
    /// Additional data workers may request.
    pub resources: &'a SharedResources,
}

/// Knobs for [`CoordinationServer::serve`].
#[derive(Debug, Clone, Default)]
pub struct ServeOptions {
    /// Time each worker has to return its results, counted from its
    /// `Purpose` (or from the start of serving if it never sends one).
    /// `None` waits forever.
    pub deadline: Option<Duration>,
    /// Stops the loop with [`DispatchError::Interrupted`] when cancelled.
    pub cancel: CancelToken,
}

#[derive(Debug)]
struct WorkerState<'a> {
    keys: &'a [CacheKey],
    started: Option<Instant>,
    finished: bool,
}

/// A bound coordination endpoint.
#[derive(Debug)]
pub struct CoordinationServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl CoordinationServer {
    /// Binds the endpoint. Use port 0 to let the OS pick one.
    pub async fn bind(addr: SocketAddr) -> Result<Self, DispatchError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DispatchError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| DispatchError::Bind { addr, source })?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves `job` until every worker has returned its results.
    ///
    /// Returns the union of all returned values. Requests from unknown
    /// workers, or for unknown resources, are answered with
    /// [`Reply::Reject`] and otherwise ignored.
    pub async fn serve<I, V, D>(
        &self,
        job: &Job<'_, I, D>,
        options: &ServeOptions,
        log: &dyn LogSink,
    ) -> Result<BTreeMap<CacheKey, V>, DispatchError>
    where
        I: Serialize + Clone,
        V: DeserializeOwned,
        D: Serialize + Clone,
    {
        let serve_start = Instant::now();
        let mut roster: BTreeMap<WorkerId, WorkerState<'_>> = job
            .units
            .iter()
            .map(|unit| {
                (
                    unit.id,
                    WorkerState {
                        keys: &unit.keys,
                        started: None,
                        finished: false,
                    },
                )
            })
            .collect();
        let mut results = BTreeMap::new();
        let mut finished = 0usize;

        log.log(&format!(
            "Serving {} workers on {}.",
            roster.len(),
            self.local_addr
        ));

        while finished < roster.len() {
            if options.cancel.is_cancelled() {
                return Err(DispatchError::Interrupted);
            }

            let next_deadline = options.deadline.and_then(|limit| {
                roster
                    .iter()
                    .filter(|(_, s)| !s.finished)
                    .map(|(id, s)| (s.started.unwrap_or(serve_start) + limit, *id))
                    .min()
            });
            let deadline_at = next_deadline.map(|(at, _)| at);

            tokio::select! {
                accepted = self.listener.accept() => {
                    let (mut stream, peer) = accepted.map_err(DispatchError::io("accepting connection"))?;
                    if let Some(message) = receive::<V>(&mut stream, peer, log).await {
                        let id = message.id;
                        let reply = match roster.get_mut(&id) {
                            None => Reply::Reject(format!("unknown worker id {id}")),
                            Some(state) => handle(
                                id,
                                message.subject,
                                state,
                                job,
                                &mut results,
                                &mut finished,
                                log,
                            ),
                        };
                        if let Reply::Reject(reason) = &reply {
                            log.warn(&format!("Rejected message from worker {id}: {reason}"));
                        }
                        respond(stream, peer, &reply).await;
                    }
                }
                _ = sleep_until_opt(deadline_at), if deadline_at.is_some() => {
                    if let (Some((_, id)), Some(waited)) = (next_deadline, options.deadline) {
                        return Err(DispatchError::WorkerTimeout { id, waited });
                    }
                }
                _ = tokio::time::sleep(CANCEL_POLL) => {}
            }
        }

        log.log(&format!(
            "All {} workers finished; {} results collected in {:.1?}.",
            roster.len(),
            results.len(),
            serve_start.elapsed(),
        ));
        Ok(results)
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Reads the one message of a connection. Connections that close without a
/// frame, or send garbage, yield `None`.
async fn receive<V: DeserializeOwned>(
    stream: &mut TcpStream,
    peer: SocketAddr,
    log: &dyn LogSink,
) -> Option<Message<V>> {
    match tokio::time::timeout(EXCHANGE_TIMEOUT, read_frame_async(stream)).await {
        Ok(Ok(Some(message))) => Some(message),
        Ok(Ok(None)) => {
            tracing::debug!(%peer, "connection closed without a message");
            None
        }
        Ok(Err(e)) => {
            log.warn(&format!("Ignoring unreadable message from {peer}: {e}"));
            None
        }
        Err(_) => {
            log.warn(&format!(
                "Ignoring connection from {peer}: no message within {EXCHANGE_TIMEOUT:?}"
            ));
            None
        }
    }
}

async fn respond<I: Serialize, D: Serialize>(
    mut stream: TcpStream,
    peer: SocketAddr,
    reply: &Reply<I, D>,
) {
    let sent = tokio::time::timeout(EXCHANGE_TIMEOUT, write_frame_async(&mut stream, reply)).await;
    match sent {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(%peer, "cannot deliver reply: {e}"),
        Err(_) => tracing::warn!(%peer, "reply not delivered within {EXCHANGE_TIMEOUT:?}"),
    }
}

fn handle<I, V, D>(
    id: WorkerId,
    subject: Subject<V>,
    state: &mut WorkerState<'_>,
    job: &Job<'_, I, D>,
    results: &mut BTreeMap<CacheKey, V>,
    finished: &mut usize,
    log: &dyn LogSink,
) -> Reply<I, D>
where
    I: Clone,
    D: Clone,
{
    match subject {
        Subject::Purpose => {
            if state.started.is_none() {
                state.started = Some(Instant::now());
            }
            tracing::debug!(id, "worker announced itself");
            Reply::Purpose(job.descriptor.clone())
        }
        Subject::Request(Resource::Items) => Reply::Items(
            state
                .keys
                .iter()
                .filter_map(|k| job.items.get(k).map(|item| (k.clone(), item.clone())))
                .collect(),
        ),
        Subject::Request(Resource::Keyed(name)) => {
            match job.resources.keyed_slice(&name, state.keys) {
                Some(slice) => Reply::Keyed(slice),
                None => Reply::Reject(format!("unknown keyed resource '{name}'")),
            }
        }
        Subject::Request(Resource::Global(name)) => match job.resources.global(&name) {
            Some(bytes) => Reply::Global(bytes.to_vec()),
            None => Reply::Reject(format!("unknown global resource '{name}'")),
        },
        Subject::Result(values) => {
            if state.finished {
                return Reply::Reject("results already received".to_string());
            }
            let keys: BTreeSet<&CacheKey> = state.keys.iter().collect();
            let (assigned, foreign): (BTreeMap<_, _>, BTreeMap<_, _>) =
                values.into_iter().partition(|(k, _)| keys.contains(k));
            if !foreign.is_empty() {
                log.warn(&format!(
                    "Worker {id} returned {} values for keys it was not assigned; discarded.",
                    foreign.len()
                ));
            }
            let count = assigned.len();
            results.extend(assigned);
            state.finished = true;
            *finished += 1;
            log.log(&format!(
                "Worker {id} returned {count} results ({} of {} workers done).",
                *finished,
                job.units.len()
            ));
            Reply::Ack
        }
        Subject::Info(text) => {
            log.log(&format!("Worker {id}: {text}"));
            Reply::Ack
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, write_frame};
    use tessera_common::MemorySink;

    fn key(byte: u8) -> CacheKey {
        CacheKey::from_digest([byte; 32])
    }

    fn exchange(addr: SocketAddr, message: &Message<f64>) -> Reply<String, u32> {
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        write_frame(&mut stream, message).unwrap();
        read_frame(&mut stream).unwrap().unwrap()
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn single_worker_round() {
        let rt = runtime();
        let server = rt
            .block_on(CoordinationServer::bind("127.0.0.1:0".parse().unwrap()))
            .unwrap();
        let addr = server.local_addr();

        let items: BTreeMap<_, _> = [(key(1), "one".to_string()), (key(2), "two".to_string())]
            .into_iter()
            .collect();
        let units = vec![WorkUnit {
            id: 0,
            keys: vec![key(2)],
        }];
        let resources = SharedResources::new();
        let job = Job {
            descriptor: 42u32,
            items: &items,
            units: &units,
            resources: &resources,
        };

        let worker = std::thread::spawn(move || {
            let purpose = exchange(
                addr,
                &Message {
                    id: 0,
                    subject: Subject::Purpose,
                },
            );
            let items = exchange(
                addr,
                &Message {
                    id: 0,
                    subject: Subject::Request(Resource::Items),
                },
            );
            let unknown = exchange(
                addr,
                &Message {
                    id: 9,
                    subject: Subject::Info("hi".to_string()),
                },
            );
            let done = exchange(
                addr,
                &Message {
                    id: 0,
                    subject: Subject::Result([(key(2), 2.0)].into_iter().collect()),
                },
            );
            (purpose, items, unknown, done)
        });

        let log = MemorySink::new();
        let results: BTreeMap<CacheKey, f64> = rt
            .block_on(server.serve(&job, &ServeOptions::default(), &log))
            .unwrap();
        let (purpose, items, unknown, done) = worker.join().unwrap();

        assert_eq!(purpose, Reply::Purpose(42));
        assert_eq!(
            items,
            Reply::Items([(key(2), "two".to_string())].into_iter().collect())
        );
        assert!(matches!(unknown, Reply::Reject(_)));
        assert_eq!(done, Reply::Ack);
        assert_eq!(results.len(), 1);
        assert_eq!(results[&key(2)], 2.0);
        assert!(log.contains("Worker 0 returned 1 results"));
        assert!(log.contains("All 1 workers finished; 1 results collected"));
    }

    #[test]
    fn deadline_without_purpose_times_out() {
        let rt = runtime();
        let server = rt
            .block_on(CoordinationServer::bind("127.0.0.1:0".parse().unwrap()))
            .unwrap();
        let items: BTreeMap<CacheKey, String> = BTreeMap::new();
        let units = vec![WorkUnit {
            id: 5,
            keys: vec![],
        }];
        let resources = SharedResources::new();
        let job = Job {
            descriptor: 0u32,
            items: &items,
            units: &units,
            resources: &resources,
        };
        let options = ServeOptions {
            deadline: Some(Duration::from_millis(100)),
            ..ServeOptions::default()
        };
        let err = rt
            .block_on(server.serve::<_, f64, _>(&job, &options, &tessera_common::NullSink))
            .unwrap_err();
        assert!(matches!(err, DispatchError::WorkerTimeout { id: 5, .. }));
    }

    #[test]
    fn cancelled_token_interrupts() {
        let rt = runtime();
        let server = rt
            .block_on(CoordinationServer::bind("127.0.0.1:0".parse().unwrap()))
            .unwrap();
        let items: BTreeMap<CacheKey, String> = BTreeMap::new();
        let units = vec![WorkUnit { id: 0, keys: vec![] }];
        let resources = SharedResources::new();
        let job = Job {
            descriptor: 0u32,
            items: &items,
            units: &units,
            resources: &resources,
        };
        let options = ServeOptions::default();
        options.cancel.cancel();
        let err = rt
            .block_on(server.serve::<_, f64, _>(&job, &options, &tessera_common::NullSink))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Interrupted));
    }

    #[test]
    fn empty_roster_finishes_immediately() {
        let rt = runtime();
        let server = rt
            .block_on(CoordinationServer::bind("127.0.0.1:0".parse().unwrap()))
            .unwrap();
        let items: BTreeMap<CacheKey, String> = BTreeMap::new();
        let resources = SharedResources::new();
        let job = Job {
            descriptor: 0u32,
            items: &items,
            units: &[],
            resources: &resources,
        };
        let results: BTreeMap<CacheKey, f64> = rt
            .block_on(server.serve(&job, &ServeOptions::default(), &tessera_common::NullSink))
            .unwrap();
        assert!(results.is_empty());
    }
}
