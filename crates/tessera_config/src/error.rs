//! Error types for configuration loading and core detection.

/// Errors that can occur when loading or validating a `tessera.toml`
/// configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An I/O error occurred while reading the configuration file.
    #[error("failed to read configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// The TOML content could not be parsed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// A configuration value failed validation.
    #[error("validation error: {0}")]
    ValidationError(String),
}

/// A batch scheduler was recognized but its allocation could not be read.
///
/// Carries a sorted dump of the environment so the failure can be diagnosed
/// from the log of a job that has already ended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "automatic core detection failed for {scheduler}: {reason}; \
     specify the cores explicitly or report the environment dump"
)]
pub struct CoreDetectionError {
    /// Name of the scheduler whose variables were present.
    pub scheduler: &'static str,
    /// What went wrong while reading them.
    pub reason: String,
    /// Every environment variable at the time of detection, sorted by name.
    pub environment: Vec<(String, String)>,
}

impl CoreDetectionError {
    /// The environment as `NAME: value` lines.
    pub fn environment_dump(&self) -> String {
        self.environment
            .iter()
            .map(|(k, v)| format!("{k}: {v}\n"))
            .collect()
    }
}
