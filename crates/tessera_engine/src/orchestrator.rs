//! Bringing a record store up to date for a set of items.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use tessera_common::{
    hash_items, CacheKey, Compute, DuplicateRegistry, Keyed, LogSink, TracingSink,
};
use tessera_config::{CoreMap, ParallelConfig};
use tessera_dispatch::{
    launch, partition, CancelToken, CoordinationServer, Job, LaunchPlan, ServeOptions,
    SharedResources, Spawners, WorkUnit, WorkerCommand,
};
use tessera_store::RecordStore;

use crate::error::EngineError;

/// How long finished workers get to exit before they are killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Where and how missing values are computed.
#[derive(Debug, Clone)]
pub struct Parallelism {
    /// Worker slots per host. A total of one means serial.
    pub cores: CoreMap,
    /// Launch template for worker processes. Required when `cores` has more
    /// than one slot.
    pub worker_command: Option<WorkerCommand>,
    /// Remote shell argv with a `{host}` placeholder.
    pub remote_shell: Vec<String>,
    /// Run once per remote session before any worker starts.
    pub env_command: Option<String>,
    /// How long each worker has to print its readiness markers.
    pub handshake_timeout: Duration,
    /// How long a worker may take to return its values. `None` waits forever.
    pub worker_timeout: Option<Duration>,
}

impl Parallelism {
    /// Everything computed in this process.
    pub fn serial() -> Self {
        Self::from_config(CoreMap::local(1), None, &ParallelConfig::default())
    }

    /// `cores` worker processes on this machine, started with `command`.
    pub fn local(cores: usize, command: WorkerCommand) -> Self {
        Self::from_config(
            CoreMap::local(cores),
            Some(command),
            &ParallelConfig::default(),
        )
    }

    /// `cores` with the launch settings of `config`.
    pub fn from_config(
        cores: CoreMap,
        worker_command: Option<WorkerCommand>,
        config: &ParallelConfig,
    ) -> Self {
        Self {
            cores,
            worker_command,
            remote_shell: config.remote_shell.clone(),
            env_command: config.env_command.clone(),
            handshake_timeout: config.handshake_timeout(),
            worker_timeout: config.worker_timeout(),
        }
    }

    /// Whether values are computed in this process.
    pub fn is_serial(&self) -> bool {
        self.cores.total() <= 1
    }
}

/// How missing values were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureMode {
    /// Nothing was missing.
    UpToDate,
    /// Computed in this process.
    Serial,
    /// Computed by this many worker processes.
    Distributed {
        /// Workers launched.
        workers: usize,
    },
}

/// Outcome of [`CacheOrchestrator::ensure`].
#[derive(Debug, Clone)]
pub struct EnsureReport {
    /// Every key of the input, without duplicates.
    pub keys: Vec<CacheKey>,
    /// Keys that appeared more than once in the input.
    pub duplicates: DuplicateRegistry,
    /// Keys that already had a record.
    pub already_stored: usize,
    /// Values computed during this call.
    pub computed: usize,
    /// Records written during this call.
    pub written: usize,
    /// How the values were produced.
    pub mode: EnsureMode,
    /// Wall time of the whole call.
    pub elapsed: Duration,
}

impl EnsureReport {
    /// Number of workers launched, zero unless distributed.
    pub fn workers(&self) -> usize {
        match self.mode {
            EnsureMode::Distributed { workers } => workers,
            _ => 0,
        }
    }
}

/// Keeps a [`RecordStore`] filled with the values of a [`Compute`].
pub struct CacheOrchestrator<C: Compute, L = TracingSink> {
    compute: C,
    store: RecordStore<C::Value>,
    resources: SharedResources,
    cancel: CancelToken,
    log: L,
}

impl<C> CacheOrchestrator<C>
where
    C: Compute,
    C::Item: Keyed + Clone,
{
    /// Pairs `compute` with `store`, logging through `tracing`.
    pub fn new(compute: C, store: RecordStore<C::Value>) -> Self {
        Self::with_log(compute, store, TracingSink)
    }
}

impl<C, L> CacheOrchestrator<C, L>
where
    C: Compute,
    C::Item: Keyed + Clone,
    L: LogSink,
{
    /// Pairs `compute` with `store`, reporting progress to `log`.
    pub fn with_log(compute: C, store: RecordStore<C::Value>, log: L) -> Self {
        Self {
            compute,
            store,
            resources: SharedResources::new(),
            cancel: CancelToken::new(),
            log,
        }
    }

    /// Resources workers may request besides their items.
    pub fn with_resources(mut self, resources: SharedResources) -> Self {
        self.resources = resources;
        self
    }

    /// A token that interrupts the run when cancelled.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The computation values come from.
    pub fn compute(&self) -> &C {
        &self.compute
    }

    /// The underlying store.
    pub fn store(&self) -> &RecordStore<C::Value> {
        &self.store
    }

    /// The underlying store, mutably.
    pub fn store_mut(&mut self) -> &mut RecordStore<C::Value> {
        &mut self.store
    }

    /// Gives back the store.
    pub fn into_store(self) -> RecordStore<C::Value> {
        self.store
    }

    /// Makes sure every item has a record, computing the missing ones.
    ///
    /// Nothing is written or launched when every key is already stored. The
    /// serial path stores each value as soon as it is computed. A failure on
    /// the distributed path aborts the call; values returned by workers
    /// before the failure are discarded and recomputed next time. Only
    /// values for missing keys are ever written.
    pub fn ensure<It>(
        &mut self,
        items: It,
        parallelism: &Parallelism,
    ) -> Result<EnsureReport, EngineError>
    where
        It: IntoIterator<Item = C::Item>,
    {
        let started = Instant::now();
        let hashed = hash_items(items, &self.log);
        let duplicates = hashed.duplicates().clone();
        let items = hashed.into_items();
        let keys: Vec<CacheKey> = items.keys().cloned().collect();

        let stored = self.store.keys()?;
        self.log
            .log(&format!("Fingerprints in store: {}.", stored.len()));
        let missing: BTreeMap<CacheKey, C::Item> = items
            .into_iter()
            .filter(|(key, _)| !stored.contains(key))
            .collect();
        let already_stored = keys.len() - missing.len();
        self.log.log(&format!(
            "Fingerprints needed: {}, already stored: {already_stored}, missing: {}.",
            keys.len(),
            missing.len()
        ));

        let mut report = EnsureReport {
            keys,
            duplicates,
            already_stored,
            computed: 0,
            written: 0,
            mode: EnsureMode::UpToDate,
            elapsed: Duration::ZERO,
        };
        if missing.is_empty() {
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        if parallelism.is_serial() {
            report.mode = EnsureMode::Serial;
            let (computed, written) = self.compute_serial(&missing)?;
            report.computed = computed;
            report.written = written;
        } else {
            let (values, workers) = self.compute_distributed(&missing, parallelism)?;
            report.mode = EnsureMode::Distributed { workers };
            // Never overwrite a record that was already stored.
            let values: BTreeMap<_, _> = values
                .into_iter()
                .filter(|(key, _)| missing.contains_key(key))
                .collect();
            let absent = missing.keys().filter(|k| !values.contains_key(*k)).count();
            report.computed = values.len();
            report.written = self.store.update(values)?;
            if absent > 0 {
                return Err(EngineError::IncompleteResults { missing: absent });
            }
        }
        self.log.log(&format!(
            "Stored {} new records in {:.1} s.",
            report.written,
            started.elapsed().as_secs_f64()
        ));
        report.elapsed = started.elapsed();
        Ok(report)
    }

    /// Computes and stores one value at a time. Returns values computed and
    /// records written.
    fn compute_serial(
        &mut self,
        missing: &BTreeMap<CacheKey, C::Item>,
    ) -> Result<(usize, usize), EngineError> {
        let started = Instant::now();
        self.log
            .log(&format!("Computing {} values serially...", missing.len()));
        let mut computed = 0;
        let mut written = 0;
        for (key, item) in missing {
            if self.cancel.is_cancelled() {
                self.log.warn(&format!(
                    "Interrupted after {computed} of {} values.",
                    missing.len()
                ));
                return Err(EngineError::Interrupted { written });
            }
            let value = self.compute.compute(item, key);
            computed += 1;
            if self.store.put(key, value)? {
                written += 1;
            }
        }
        self.log.log(&format!(
            "...computed {computed} values in {:.1} s.",
            started.elapsed().as_secs_f64()
        ));
        Ok((computed, written))
    }

    fn compute_distributed(
        &self,
        missing: &BTreeMap<CacheKey, C::Item>,
        parallelism: &Parallelism,
    ) -> Result<(BTreeMap<CacheKey, C::Value>, usize), EngineError> {
        let command = parallelism
            .worker_command
            .as_ref()
            .ok_or(EngineError::NoWorkerCommand {
                cores: parallelism.cores.total(),
            })?;
        let plan = LaunchPlan::new(&parallelism.cores, missing.len());
        let Some(parts) = NonZeroUsize::new(plan.len()) else {
            return Ok((BTreeMap::new(), 0));
        };
        let units: Vec<WorkUnit> = plan
            .worker_ids()
            .zip(partition(missing.keys().cloned(), parts))
            .map(|(id, keys)| WorkUnit { id, keys })
            .collect();
        self.log.log(&format!(
            "Distributing {} values over {} workers ({}).",
            missing.len(),
            plan.len(),
            parallelism.cores
        ));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(EngineError::Runtime)?;
        let job = Job {
            descriptor: self.compute.descriptor(),
            items: missing,
            units: &units,
            resources: &self.resources,
        };
        let options = ServeOptions {
            deadline: parallelism.worker_timeout,
            cancel: self.cancel.clone(),
        };
        let log: &dyn LogSink = &self.log;

        let started = Instant::now();
        let values: BTreeMap<CacheKey, C::Value> = runtime.block_on(async {
            let server = CoordinationServer::bind(plan.bind_addr()).await?;
            let address = plan.advertised_addr(server.local_addr());
            let spawners = Spawners::new(
                parallelism.remote_shell.clone(),
                parallelism.env_command.clone(),
            );
            let pool = launch(
                &plan,
                command,
                &address,
                spawners,
                parallelism.handshake_timeout,
                &self.cancel,
                log,
            )
            .await?;
            let values = server.serve(&job, &options, log).await?;
            pool.shutdown(SHUTDOWN_GRACE).await;
            Ok::<_, EngineError>(values)
        })?;
        self.log.log(&format!(
            "Workers returned {} values in {:.1} s.",
            values.len(),
            started.elapsed().as_secs_f64()
        ));
        Ok((values, plan.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_parallelism_has_one_core() {
        let p = Parallelism::serial();
        assert!(p.is_serial());
        assert!(p.worker_command.is_none());
    }

    #[test]
    fn local_parallelism_uses_config_defaults() {
        let command = WorkerCommand::new("w --id {id} --server {server}").unwrap();
        let p = Parallelism::local(3, command);
        assert!(!p.is_serial());
        assert_eq!(p.cores.total(), 3);
        assert_eq!(p.handshake_timeout, Duration::from_secs(60));
        assert_eq!(p.worker_timeout, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn workers_only_counted_when_distributed() {
        let mut report = EnsureReport {
            keys: Vec::new(),
            duplicates: DuplicateRegistry::default(),
            already_stored: 0,
            computed: 0,
            written: 0,
            mode: EnsureMode::Serial,
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.workers(), 0);
        report.mode = EnsureMode::Distributed { workers: 4 };
        assert_eq!(report.workers(), 4);
    }
}
