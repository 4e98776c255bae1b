//! Error types for record store operations.

use std::path::PathBuf;

use tessera_common::CacheKey;

/// Errors that can occur while reading or writing the record store.
///
/// Unlike a build cache, nothing here is fail-safe: a missing key or a
/// corrupt payload is reported to the caller, never turned into a miss.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key is in neither the loose directory nor the archive.
    #[error("key not found in store: {key}")]
    KeyNotFound {
        /// The requested key.
        key: CacheKey,
    },

    /// A stored payload could not be decoded.
    #[error("cannot decode record {origin}: {reason}")]
    Decode {
        /// Where the payload came from (loose path or archive member).
        origin: String,
        /// Description of the decode failure.
        reason: String,
    },

    /// A value could not be serialized.
    #[error("cannot encode record {key}: {reason}")]
    Encode {
        /// The key being written.
        key: CacheKey,
        /// Description of the serialization failure.
        reason: String,
    },

    /// An I/O error occurred on a store file.
    #[error("store I/O error at {path}: {source}")]
    Io {
        /// The path that caused the error.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}
