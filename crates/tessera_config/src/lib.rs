//! Parsing and validation of `tessera.toml`, plus core-allocation detection.
//!
//! This crate reads the configuration file into a strongly-typed
//! [`TesseraConfig`] and works out the [`CoreMap`] that distributed runs
//! spread their workers over.

#![warn(missing_docs)]

pub mod cores;
pub mod error;
pub mod loader;
pub mod types;

pub use cores::{
    default_detectors, detect_cores, expand_hostlist, resolve_cores, CoreAssignment,
    CoreDetector, CoreMap, Detection, EnvSnapshot, LOCALHOST,
};
pub use error::{ConfigError, CoreDetectionError};
pub use loader::{load_config, load_config_file, load_config_from_str, CONFIG_FILE};
pub use types::*;
