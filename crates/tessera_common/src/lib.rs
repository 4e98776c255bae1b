//! Shared foundational types for the Tessera fingerprint cache.
//!
//! This crate provides the content-derived [`CacheKey`] and the
//! [`KeyHasher`] that produces it, the reference [`Structure`] item type,
//! the [`Compute`] contract, payload [`Checksum`]s, and the [`LogSink`]
//! progress interface shared by every other crate.

#![warn(missing_docs)]

pub mod compute;
pub mod hash;
pub mod hashing;
pub mod key;
pub mod log;
pub mod structure;

pub use compute::Compute;
pub use hash::Checksum;
pub use hashing::{hash_items, DuplicateRegistry, HashedItems, KeyHasher, Keyed};
pub use key::{CacheKey, InvalidKey, KEY_LEN};
pub use log::{LogLevel, LogSink, MemorySink, NullSink, TracingSink};
pub use structure::Structure;
