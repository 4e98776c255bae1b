//! Configuration types deserialized from `tessera.toml`.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cores::{CoreMap, LOCALHOST};

/// The top-level configuration parsed from `tessera.toml`.
///
/// Every section is optional; an empty file yields the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TesseraConfig {
    /// Where fingerprint records are stored.
    #[serde(default)]
    pub store: StoreConfig,
    /// How outstanding work is distributed.
    #[serde(default)]
    pub parallel: ParallelConfig,
    /// Parameters of the reference fingerprint.
    #[serde(default)]
    pub descriptor: DescriptorConfig,
}

/// Record store settings.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Store directory. The `.fpdb` extension is added when missing.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "fingerprints".to_string()
}

/// Settings for distributing work across worker processes.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelConfig {
    /// Explicit core allocation. Detected from the environment when absent.
    ///
    /// Accepts either a count for this machine (`cores = 4`) or a table of
    /// host names to counts (`cores = { node1 = 8, node2 = 8 }`).
    #[serde(default, deserialize_with = "deserialize_cores")]
    pub cores: Option<CoreSpec>,
    /// Shell command run once in every remote session before workers start,
    /// e.g. to activate an environment.
    #[serde(default)]
    pub env_command: Option<String>,
    /// Worker launch template with `{id}` and `{server}` placeholders.
    /// Defaults to re-running the current executable as a worker.
    #[serde(default)]
    pub worker_command: Option<String>,
    /// Remote shell argv. `{host}` is replaced with the target host.
    #[serde(default = "default_remote_shell")]
    pub remote_shell: Vec<String>,
    /// Seconds to wait for each worker's readiness markers.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Seconds a worker may take to return its results. `0` waits forever.
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            cores: None,
            env_command: None,
            worker_command: None,
            remote_shell: default_remote_shell(),
            handshake_timeout_secs: default_handshake_timeout(),
            worker_timeout_secs: default_worker_timeout(),
        }
    }
}

impl ParallelConfig {
    /// The handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// The per-worker deadline, or `None` when disabled.
    pub fn worker_timeout(&self) -> Option<Duration> {
        (self.worker_timeout_secs > 0).then(|| Duration::from_secs(self.worker_timeout_secs))
    }
}

fn default_remote_shell() -> Vec<String> {
    ["ssh", "-T", "-o", "BatchMode=yes", "{host}"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_handshake_timeout() -> u64 {
    60
}

fn default_worker_timeout() -> u64 {
    3600
}

/// An explicit core allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreSpec {
    /// A number of cores on this machine.
    Count(usize),
    /// Cores per host name.
    Hosts(BTreeMap<String, usize>),
}

impl CoreSpec {
    /// Converts the allocation into a [`CoreMap`].
    pub fn to_core_map(&self) -> CoreMap {
        match self {
            CoreSpec::Count(n) => CoreMap::from_iter([(LOCALHOST.to_string(), *n)]),
            CoreSpec::Hosts(hosts) => hosts.iter().map(|(h, n)| (h.clone(), *n)).collect(),
        }
    }
}

/// Deserializes `cores` from either an integer or a table of integers.
fn deserialize_cores<'de, D>(deserializer: D) -> Result<Option<CoreSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    struct CountOrHosts;

    impl<'de> Visitor<'de> for CountOrHosts {
        type Value = CoreSpec;

        fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter.write_str("a core count or a table of host names to core counts")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            usize::try_from(v)
                .map(CoreSpec::Count)
                .map_err(|_| E::custom(format!("core count must not be negative, got {v}")))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            usize::try_from(v)
                .map(CoreSpec::Count)
                .map_err(|_| E::custom(format!("core count {v} is too large")))
        }

        fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut hosts = BTreeMap::new();
            while let Some((host, count)) = map.next_entry::<String, usize>()? {
                hosts.insert(host, count);
            }
            Ok(CoreSpec::Hosts(hosts))
        }
    }

    deserializer.deserialize_any(CountOrHosts).map(Some)
}

/// Parameters of the reference neighbor-distance fingerprint.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DescriptorConfig {
    /// Neighbor cutoff radius in the units of the positions.
    #[serde(default = "default_cutoff")]
    pub cutoff: f64,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            cutoff: default_cutoff(),
        }
    }
}

fn default_cutoff() -> f64 {
    6.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: TesseraConfig = toml::from_str("").unwrap();
        assert_eq!(config.store.path, "fingerprints");
        assert!(config.parallel.cores.is_none());
        assert_eq!(config.parallel.remote_shell[0], "ssh");
        assert_eq!(config.parallel.handshake_timeout(), Duration::from_secs(60));
        assert_eq!(
            config.parallel.worker_timeout(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(config.descriptor.cutoff, 6.5);
    }

    #[test]
    fn cores_as_count() {
        let config: TesseraConfig = toml::from_str("[parallel]\ncores = 4\n").unwrap();
        let spec = config.parallel.cores.unwrap();
        assert_eq!(spec, CoreSpec::Count(4));
        assert_eq!(spec.to_core_map().total(), 4);
    }

    #[test]
    fn cores_as_host_table() {
        let toml = r#"
[parallel]
cores = { node1 = 8, node2 = 16 }
"#;
        let config: TesseraConfig = toml::from_str(toml).unwrap();
        let map = config.parallel.cores.unwrap().to_core_map();
        assert_eq!(map.get("node1"), Some(8));
        assert_eq!(map.total(), 24);
    }

    #[test]
    fn negative_cores_rejected() {
        let result: Result<TesseraConfig, _> = toml::from_str("[parallel]\ncores = -2\n");
        assert!(result.is_err());
    }

    #[test]
    fn zero_worker_timeout_disables_deadline() {
        let config: TesseraConfig =
            toml::from_str("[parallel]\nworker_timeout_secs = 0\n").unwrap();
        assert_eq!(config.parallel.worker_timeout(), None);
    }

    #[test]
    fn unknown_field_rejected() {
        let result: Result<TesseraConfig, _> = toml::from_str("[store]\npth = \"x\"\n");
        assert!(result.is_err());
    }
}
