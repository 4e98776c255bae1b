//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::{CoreSpec, TesseraConfig};
use std::path::Path;

/// Name of the configuration file looked up in a project directory.
pub const CONFIG_FILE: &str = "tessera.toml";

/// Loads and validates `<project_dir>/tessera.toml`.
///
/// A missing file is not an error: the defaults are returned instead.
pub fn load_config(project_dir: &Path) -> Result<TesseraConfig, ConfigError> {
    let config_path = project_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        return Ok(TesseraConfig::default());
    }
    load_config_file(&config_path)
}

/// Loads and validates the configuration at an explicit path.
pub fn load_config_file(path: &Path) -> Result<TesseraConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

/// Parses and validates a `tessera.toml` configuration from a string.
///
/// Useful for testing without filesystem dependencies.
pub fn load_config_from_str(content: &str) -> Result<TesseraConfig, ConfigError> {
    let config: TesseraConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// Checks values that parse but cannot work.
fn validate_config(config: &TesseraConfig) -> Result<(), ConfigError> {
    if config.store.path.trim().is_empty() {
        return Err(invalid("store.path must not be empty"));
    }

    let parallel = &config.parallel;
    match &parallel.cores {
        Some(CoreSpec::Count(0)) => return Err(invalid("parallel.cores must be positive")),
        Some(CoreSpec::Hosts(hosts)) if hosts.is_empty() => {
            return Err(invalid("parallel.cores lists no hosts"))
        }
        Some(CoreSpec::Hosts(hosts)) => {
            if let Some((host, _)) = hosts.iter().find(|(_, n)| **n == 0) {
                return Err(invalid(format!(
                    "parallel.cores.{host} must be positive"
                )));
            }
        }
        _ => {}
    }

    if let Some(command) = &parallel.worker_command {
        for placeholder in ["{id}", "{server}"] {
            if !command.contains(placeholder) {
                return Err(invalid(format!(
                    "parallel.worker_command must contain {placeholder}"
                )));
            }
        }
    }
    if parallel.remote_shell.is_empty() {
        return Err(invalid("parallel.remote_shell must not be empty"));
    }
    if !parallel.remote_shell.iter().any(|arg| arg.contains("{host}")) {
        return Err(invalid("parallel.remote_shell must contain {host}"));
    }
    if parallel.handshake_timeout_secs == 0 {
        return Err(invalid("parallel.handshake_timeout_secs must be positive"));
    }

    let cutoff = config.descriptor.cutoff;
    if !(cutoff.is_finite() && cutoff > 0.0) {
        return Err(invalid(format!(
            "descriptor.cutoff must be a positive number, got {cutoff}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let toml = r#"
[store]
path = "data/train"

[parallel]
cores = { localhost = 2, node7 = 8 }
env_command = "source ~/venv/bin/activate"
worker_command = "tessera worker --id {id} --server {server}"
remote_shell = ["ssh", "-x", "{host}"]
handshake_timeout_secs = 30
worker_timeout_secs = 600

[descriptor]
cutoff = 4.0
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.store.path, "data/train");
        assert_eq!(
            config.parallel.cores.as_ref().unwrap().to_core_map().total(),
            10
        );
        assert_eq!(
            config.parallel.env_command.as_deref(),
            Some("source ~/venv/bin/activate")
        );
        assert_eq!(config.parallel.remote_shell, vec!["ssh", "-x", "{host}"]);
        assert_eq!(config.parallel.handshake_timeout_secs, 30);
        assert_eq!(config.descriptor.cutoff, 4.0);
    }

    #[test]
    fn invalid_toml_errors() {
        let err = load_config_from_str("this is not valid toml {{{}}}").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn zero_cores_rejected() {
        let err = load_config_from_str("[parallel]\ncores = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn host_with_zero_cores_rejected() {
        let err = load_config_from_str("[parallel]\ncores = { a = 1, b = 0 }\n").unwrap_err();
        assert!(err.to_string().contains("parallel.cores.b"));
    }

    #[test]
    fn worker_command_requires_placeholders() {
        let err =
            load_config_from_str("[parallel]\nworker_command = \"tessera worker {id}\"\n")
                .unwrap_err();
        assert!(err.to_string().contains("{server}"));
    }

    #[test]
    fn remote_shell_requires_host() {
        let err = load_config_from_str("[parallel]\nremote_shell = [\"ssh\"]\n").unwrap_err();
        assert!(err.to_string().contains("{host}"));
    }

    #[test]
    fn non_positive_cutoff_rejected() {
        let err = load_config_from_str("[descriptor]\ncutoff = -1.0\n").unwrap_err();
        assert!(err.to_string().contains("descriptor.cutoff"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.store.path, "fingerprints");
    }

    #[test]
    fn file_in_project_dir_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[store]\npath = \"x\"\n").unwrap();
        assert_eq!(load_config(dir.path()).unwrap().store.path, "x");
    }
}
