//! Launching the worker pool and waiting for every worker to become ready.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tessera_common::LogSink;
use tessera_config::{CoreMap, LOCALHOST};

use crate::cancel::CancelToken;
use crate::error::DispatchError;
use crate::protocol::WorkerId;
use crate::spawner::{LocalSpawner, RemoteSpawner, Session, Spawner};

/// Which worker ids run on which host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    hosts: Vec<(String, Vec<WorkerId>)>,
}

impl LaunchPlan {
    /// Assigns up to `workers` ids to the slots of `cores`, contiguously and
    /// host by host in core-map order.
    pub fn new(cores: &CoreMap, workers: usize) -> Self {
        let mut next: WorkerId = 0;
        let mut hosts = Vec::new();
        for (host, slots) in cores.iter() {
            let take = slots.min(workers - next);
            if take == 0 {
                continue;
            }
            hosts.push((host.to_string(), (next..next + take).collect()));
            next += take;
        }
        Self { hosts }
    }

    /// Number of workers in the plan.
    pub fn len(&self) -> usize {
        self.hosts.iter().map(|(_, ids)| ids.len()).sum()
    }

    /// Whether the plan launches nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every worker id, in launch order.
    pub fn worker_ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.hosts.iter().flat_map(|(_, ids)| ids.iter().copied())
    }

    /// `(host, ids)` pairs in launch order.
    pub fn hosts(&self) -> impl Iterator<Item = (&str, &[WorkerId])> {
        self.hosts.iter().map(|(h, ids)| (h.as_str(), ids.as_slice()))
    }

    /// Whether every host is this machine.
    pub fn is_all_local(&self) -> bool {
        self.hosts.iter().all(|(h, _)| is_local_host(h))
    }

    /// Where the coordination server should bind for this plan: loopback
    /// when everything runs here, every interface otherwise.
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = if self.is_all_local() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        SocketAddr::new(ip, 0)
    }

    /// The address workers should connect to, given the bound address.
    pub fn advertised_addr(&self, bound: SocketAddr) -> String {
        if self.is_all_local() || !bound.ip().is_unspecified() {
            return bound.to_string();
        }
        let name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| LOCALHOST.to_string());
        format!("{name}:{}", bound.port())
    }
}

/// Whether `host` names this machine.
pub fn is_local_host(host: &str) -> bool {
    if host == LOCALHOST {
        return true;
    }
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .is_some_and(|name| name == host || name.split('.').next() == Some(host))
}

/// A worker launch template with `{id}` and `{server}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    template: String,
}

impl WorkerCommand {
    /// Validates `template`.
    pub fn new(template: impl Into<String>) -> Result<Self, DispatchError> {
        let template = template.into();
        for placeholder in ["{id}", "{server}"] {
            if !template.contains(placeholder) {
                return Err(DispatchError::InvalidCommand {
                    template,
                    reason: format!("missing {placeholder} placeholder"),
                });
            }
        }
        Ok(Self { template })
    }

    /// The command line for worker `id`.
    pub fn render(&self, id: WorkerId, server: &str) -> String {
        self.template
            .replace("{id}", &id.to_string())
            .replace("{server}", server)
    }

    /// The unrendered template.
    pub fn template(&self) -> &str {
        &self.template
    }
}

/// The spawners used for local and remote hosts.
pub struct Spawners {
    local: Box<dyn Spawner>,
    remote: Box<dyn Spawner>,
}

impl Spawners {
    /// Local child processes, and `remote_shell` sessions for other hosts.
    pub fn new(remote_shell: Vec<String>, env_command: Option<String>) -> Self {
        Self::with(
            Box::new(LocalSpawner::new()),
            Box::new(RemoteSpawner::new(remote_shell, env_command)),
        )
    }

    /// Explicit spawners, e.g. for tests.
    pub fn with(local: Box<dyn Spawner>, remote: Box<dyn Spawner>) -> Self {
        Self { local, remote }
    }

    fn for_host(&mut self, host: &str) -> &mut dyn Spawner {
        if is_local_host(host) {
            self.local.as_mut()
        } else {
            self.remote.as_mut()
        }
    }
}

impl std::fmt::Debug for Spawners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawners").finish_non_exhaustive()
    }
}

/// Every process started for one distribution round.
///
/// Dropping the pool kills any process still running.
#[derive(Debug)]
pub struct WorkerPool {
    sessions: Vec<Session>,
    workers: usize,
}

impl WorkerPool {
    /// Number of workers that became ready.
    pub fn len(&self) -> usize {
        self.workers
    }

    /// Whether no worker was launched.
    pub fn is_empty(&self) -> bool {
        self.workers == 0
    }

    /// Lets every process exit on its own for up to `grace`, then kills it.
    pub async fn shutdown(self, grace: Duration) {
        for session in self.sessions {
            session.close(grace).await;
        }
    }
}

/// Starts every worker of `plan` and waits, one worker at a time, for its
/// readiness markers.
///
/// The first worker that fails to become ready within `handshake_timeout`
/// aborts the launch; processes already started are killed when the
/// partially built pool is dropped. Cancelling `cancel` aborts it the same
/// way with [`DispatchError::Interrupted`].
pub async fn launch(
    plan: &LaunchPlan,
    command: &WorkerCommand,
    server: &str,
    mut spawners: Spawners,
    handshake_timeout: Duration,
    cancel: &CancelToken,
    log: &dyn LogSink,
) -> Result<WorkerPool, DispatchError> {
    let started = Instant::now();
    let mut launched = 0;
    let outcome = launch_all(
        plan,
        command,
        server,
        &mut spawners,
        handshake_timeout,
        cancel,
        &mut launched,
        log,
    )
    .await;

    let mut sessions = spawners.local.into_sessions();
    sessions.extend(spawners.remote.into_sessions());
    let pool = WorkerPool {
        sessions,
        workers: launched,
    };
    outcome?;

    log.log(&format!(
        "{} workers ready after {:.1?}.",
        pool.len(),
        started.elapsed()
    ));
    Ok(pool)
}

#[allow(clippy::too_many_arguments)]
async fn launch_all(
    plan: &LaunchPlan,
    command: &WorkerCommand,
    server: &str,
    spawners: &mut Spawners,
    handshake_timeout: Duration,
    cancel: &CancelToken,
    launched: &mut usize,
    log: &dyn LogSink,
) -> Result<(), DispatchError> {
    for (host, ids) in plan.hosts() {
        log.log(&format!("Starting {} workers on {host}.", ids.len()));
        let spawner = spawners.for_host(host);
        for &id in ids {
            if cancel.is_cancelled() {
                return Err(DispatchError::Interrupted);
            }
            let line = command.render(id, server);
            tracing::debug!(id, host, "launching: {line}");
            let session = spawner.spawn(host, &line)?;
            let between = tokio::select! {
                between = session.await_markers(id, handshake_timeout) => between?,
                _ = cancel.cancelled() => return Err(DispatchError::Interrupted),
            };
            for text in between {
                log.log(&format!("  worker {id}: {text}"));
            }
            *launched += 1;
        }
    }
    Ok(())
}
