//! Deriving cache keys from item content.
//!
//! [`KeyHasher`] turns a [`Structure`] into its [`CacheKey`]; [`hash_items`]
//! runs one hashing pass over a dataset, building the key index and counting
//! duplicate inputs along the way.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::key::CacheKey;
use crate::log::LogSink;
use crate::structure::Structure;

/// Anything that can name its own cache key.
pub trait Keyed {
    /// Returns the content-derived key. Must be pure.
    fn cache_key(&self) -> CacheKey;
}

impl Keyed for Structure {
    fn cache_key(&self) -> CacheKey {
        KeyHasher::hash(self)
    }
}

/// Stable, content-derived hashing of structures.
pub struct KeyHasher;

impl KeyHasher {
    /// Decimal digits used when formatting cell and position components.
    ///
    /// Enough to separate physically distinct configurations while staying
    /// clear of the last bits of floating-point noise.
    pub const PRECISION: usize = 15;

    /// Returns the canonical string the key is digested from.
    ///
    /// Fixed order: periodic flags, cell components, species, positions.
    pub fn canonical_form(structure: &Structure) -> String {
        let mut s = String::with_capacity(64 + 60 * structure.positions.len());
        for flag in structure.pbc {
            s.push(if flag { 'T' } else { 'F' });
        }
        for row in &structure.cell {
            for x in row {
                let _ = write!(s, "{x:.prec$}", prec = Self::PRECISION);
            }
        }
        s.push('[');
        for (i, n) in structure.numbers.iter().enumerate() {
            if i > 0 {
                s.push(' ');
            }
            let _ = write!(s, "{n}");
        }
        s.push(']');
        for position in &structure.positions {
            for x in position {
                let _ = write!(s, "{x:.prec$}", prec = Self::PRECISION);
            }
        }
        s
    }

    /// Computes the cache key of a structure.
    pub fn hash(structure: &Structure) -> CacheKey {
        let digest = Sha256::digest(Self::canonical_form(structure).as_bytes());
        CacheKey::from_digest(digest)
    }
}

/// Per-key count of repeated occurrences within one hashing pass.
///
/// A key seen once never appears here; a key seen three times maps to 2.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateRegistry {
    repeats: BTreeMap<CacheKey, usize>,
}

impl DuplicateRegistry {
    /// Records one more repeat of `key`.
    pub fn record(&mut self, key: &CacheKey) {
        *self.repeats.entry(key.clone()).or_insert(0) += 1;
    }

    /// Number of repeats recorded for `key`.
    pub fn repeats(&self, key: &CacheKey) -> usize {
        self.repeats.get(key).copied().unwrap_or(0)
    }

    /// Total repeats across all keys.
    pub fn total(&self) -> usize {
        self.repeats.values().sum()
    }

    /// Returns `true` if no duplicate was seen.
    pub fn is_empty(&self) -> bool {
        self.repeats.is_empty()
    }

    /// Iterates over `(key, repeats)` in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, usize)> {
        self.repeats.iter().map(|(k, n)| (k, *n))
    }
}

/// The result of a hashing pass: items indexed by key, plus duplicates.
#[derive(Debug, Clone)]
pub struct HashedItems<I> {
    items: BTreeMap<CacheKey, I>,
    duplicates: DuplicateRegistry,
}

impl<I> HashedItems<I> {
    /// The key-indexed items. Later duplicates replaced earlier ones.
    pub fn items(&self) -> &BTreeMap<CacheKey, I> {
        &self.items
    }

    /// Consumes the pass, keeping only the index.
    pub fn into_items(self) -> BTreeMap<CacheKey, I> {
        self.items
    }

    /// Duplicate accounting for the pass.
    pub fn duplicates(&self) -> &DuplicateRegistry {
        &self.duplicates
    }

    /// Number of unique items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if no items were hashed.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Hashes every item into a key-indexed map.
///
/// A repeated key logs one duplicate warning per repeat and is counted in the
/// [`DuplicateRegistry`]; the last item seen for a key is the one kept.
pub fn hash_items<I, It>(items: It, log: &dyn LogSink) -> HashedItems<I>
where
    I: Keyed,
    It: IntoIterator<Item = I>,
{
    let started = Instant::now();
    log.log("Hashing items...");
    let mut index = BTreeMap::new();
    let mut duplicates = DuplicateRegistry::default();
    for item in items {
        let key = item.cache_key();
        if index.contains_key(&key) {
            log.warn(&format!(
                "Duplicate item (based on identical hash). Was this expected? Hash: {key}"
            ));
            duplicates.record(&key);
        }
        index.insert(key, item);
    }
    log.log(&format!(" {} unique items after hashing.", index.len()));
    log.log(&format!(
        "...hashing completed in {:.1} s.",
        started.elapsed().as_secs_f64()
    ));
    HashedItems {
        items: index,
        duplicates,
    }
}
