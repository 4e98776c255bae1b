//! Persistent fingerprint record storage.
//!
//! A [`RecordStore`] maps [`CacheKey`](tessera_common::CacheKey)s to
//! serialized values. New records land as loose files; [`RecordStore::compact`]
//! folds them into a single gzip-compressed tar archive. Loose records always
//! take precedence over archived ones.

#![warn(missing_docs)]

pub mod archive;
pub mod error;
pub mod record;
pub mod store;

pub use archive::ARCHIVE_FILE;
pub use error::StoreError;
pub use record::{decode_record, encode_record};
pub use store::{CompactionReport, RecordStore, STORE_SUFFIX};
