//! Shared setup for commands: configuration, store location, cores and the
//! worker launch command.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_config::{
    load_config, load_config_file, resolve_cores, CoreAssignment, CoreDetectionError, CoreSpec,
    EnvSnapshot, TesseraConfig,
};
use tessera_dispatch::WorkerCommand;
use tessera_store::{RecordStore, StoreError};

use crate::GlobalArgs;

/// Configuration plus the command-line overrides that apply to it.
pub struct Context {
    /// The loaded configuration.
    pub config: TesseraConfig,
    /// Store directory after applying `--store`.
    pub store_path: PathBuf,
}

impl Context {
    /// Loads `--config` when given, otherwise `tessera.toml` in the current
    /// directory. A missing file yields the defaults.
    pub fn load(global: &GlobalArgs) -> Result<Self, Box<dyn std::error::Error>> {
        let config = match &global.config {
            Some(path) => load_config_file(Path::new(path))?,
            None => load_config(&std::env::current_dir()?)?,
        };
        let store_path = PathBuf::from(global.store.as_deref().unwrap_or(&config.store.path));
        Ok(Self { config, store_path })
    }

    /// Opens the store, creating it if needed.
    pub fn open_store<V>(&self) -> Result<RecordStore<V>, StoreError>
    where
        V: Serialize + DeserializeOwned + Clone,
    {
        RecordStore::open(&self.store_path)
    }

    /// The core allocation: `count` on this machine when given, else the
    /// configured allocation, else whatever the environment says.
    ///
    /// A failed detection logs the environment dump before returning.
    pub fn cores(&self, count: Option<usize>) -> Result<CoreAssignment, CoreDetectionError> {
        let spec = count
            .map(CoreSpec::Count)
            .or_else(|| self.config.parallel.cores.clone());
        resolve_cores(spec.as_ref(), &EnvSnapshot::from_process()).inspect_err(|e| {
            tracing::error!("environment at detection time:\n{}", e.environment_dump());
        })
    }

    /// The worker launch template: `template` when given, else the
    /// configured one, else this executable's `worker` subcommand.
    pub fn worker_command(
        &self,
        template: Option<&str>,
    ) -> Result<WorkerCommand, Box<dyn std::error::Error>> {
        let template = match template.or(self.config.parallel.worker_command.as_deref()) {
            Some(t) => t.to_string(),
            None => default_worker_command(&std::env::current_exe()?),
        };
        Ok(WorkerCommand::new(template)?)
    }
}

/// Runs `exe worker` with the id and server filled in.
pub fn default_worker_command(exe: &Path) -> String {
    format!(
        "{} worker --id {{id}} --server {{server}}",
        shell_words::quote(&exe.to_string_lossy())
    )
}
