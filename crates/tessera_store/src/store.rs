//! The record store: loose files in front of a compacted archive.
//!
//! Layout on disk:
//!
//! ```text
//! <name>.fpdb/
//!   loose/<key>        one record per file, authoritative
//!   archive.tar.gz     compacted records, shadowed by loose entries
//! ```
//!
//! Several processes may write to the same store at once. Loose writes go to
//! a hidden temporary sibling and are renamed into place, so readers never
//! see a partial record. Writers of the same key race with last-write-wins.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_common::CacheKey;

use crate::archive::Archive;
use crate::error::StoreError;
use crate::record::{decode_record, encode_record};

/// Conventional extension of a store directory.
pub const STORE_SUFFIX: &str = "fpdb";

/// Subdirectory holding loose records.
const LOOSE_DIR: &str = "loose";

/// Counts reported by [`RecordStore::compact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Loose records present before compaction started.
    pub loose_before: usize,
    /// Archive members extracted because no loose entry shadowed them.
    pub extracted: usize,
    /// Members in the rewritten archive.
    pub archived: usize,
    /// Loose files deleted after the new archive was in place.
    pub removed: usize,
}

impl CompactionReport {
    /// Whether the compaction left the store untouched.
    pub fn is_noop(&self) -> bool {
        self.loose_before == 0
    }
}

/// A persistent mapping from [`CacheKey`] to values of type `V`.
///
/// Reads consult an in-memory cache first, then the loose directory, then the
/// archive. Every value read from or written to disk through this instance is
/// kept in memory for the lifetime of the instance.
pub struct RecordStore<V> {
    root: PathBuf,
    loose: PathBuf,
    archive: Archive,
    memory: HashMap<CacheKey, V>,
    _value: PhantomData<fn() -> V>,
}

impl<V> std::fmt::Debug for RecordStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("root", &self.root)
            .field("cached", &self.memory.len())
            .finish()
    }
}

impl<V> RecordStore<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Opens the store at `path`, creating it if needed.
    ///
    /// The `.fpdb` extension is appended when `path` does not already carry
    /// it. Opening is idempotent and never touches existing records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = with_store_suffix(path.as_ref());
        let loose = root.join(LOOSE_DIR);
        fs::create_dir_all(&loose).map_err(StoreError::io(&loose))?;
        Ok(Self {
            archive: Archive::new(&root),
            root,
            loose,
            memory: HashMap::new(),
            _value: PhantomData,
        })
    }

    /// The store directory, including its suffix.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// The compacted archive file. It may not exist yet.
    pub fn archive_path(&self) -> &Path {
        self.archive.path()
    }

    fn loose_path(&self, key: &CacheKey) -> PathBuf {
        self.loose.join(key.as_str())
    }

    /// Returns the value stored under `key`.
    pub fn get(&mut self, key: &CacheKey) -> Result<V, StoreError> {
        if let Some(value) = self.memory.get(key) {
            return Ok(value.clone());
        }

        let loose_path = self.loose_path(key);
        let value: V = match fs::read(&loose_path) {
            Ok(raw) => decode_record(&raw, &loose_path.display().to_string())?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let raw = self
                    .archive
                    .read(key)?
                    .ok_or_else(|| StoreError::KeyNotFound { key: key.clone() })?;
                let origin = format!("{}:{key}", self.archive.path().display());
                decode_record(&raw, &origin)?
            }
            Err(e) => return Err(StoreError::io(&loose_path)(e)),
        };

        self.memory.insert(key.clone(), value.clone());
        Ok(value)
    }

    /// Stores `value` under `key` as a loose record.
    ///
    /// Returns `false` when an identical loose record already existed and
    /// nothing was written.
    pub fn put(&mut self, key: &CacheKey, value: V) -> Result<bool, StoreError> {
        let encoded = encode_record(key, &value)?;
        let target = self.loose_path(key);

        let unchanged = match fs::read(&target) {
            Ok(existing) => existing == encoded,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(StoreError::io(&target)(e)),
        };
        if !unchanged {
            self.write_loose(key, &encoded)?;
        }

        self.memory.insert(key.clone(), value);
        Ok(!unchanged)
    }

    /// Stores every entry of `entries`. Returns how many records were
    /// actually written.
    pub fn update<I>(&mut self, entries: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = (CacheKey, V)>,
    {
        let mut written = 0;
        for (key, value) in entries {
            if self.put(&key, value)? {
                written += 1;
            }
        }
        Ok(written)
    }

    fn write_loose(&self, key: &CacheKey, bytes: &[u8]) -> Result<(), StoreError> {
        let tmp = self
            .loose
            .join(format!(".{key}.{}.tmp", std::process::id()));
        fs::write(&tmp, bytes).map_err(StoreError::io(&tmp))?;
        let target = self.loose_path(key);
        fs::rename(&tmp, &target).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::io(&target)(e)
        })
    }

    /// Keys of the loose records.
    pub fn loose_keys(&self) -> Result<BTreeSet<CacheKey>, StoreError> {
        let entries = fs::read_dir(&self.loose).map_err(StoreError::io(&self.loose))?;
        let mut keys = BTreeSet::new();
        for entry in entries {
            let entry = entry.map_err(StoreError::io(&self.loose))?;
            if let Some(key) = entry
                .file_name()
                .to_str()
                .and_then(|name| CacheKey::parse(name).ok())
            {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    /// Keys of the archive members, shadowed or not.
    pub fn archived_keys(&self) -> Result<BTreeSet<CacheKey>, StoreError> {
        self.archive.keys()
    }

    /// Every key with a record, loose or archived.
    pub fn keys(&self) -> Result<BTreeSet<CacheKey>, StoreError> {
        let mut keys = self.loose_keys()?;
        keys.extend(self.archive.keys()?);
        Ok(keys)
    }

    /// Whether `key` has a record.
    pub fn contains(&self, key: &CacheKey) -> Result<bool, StoreError> {
        if self.memory.contains_key(key) || self.loose_path(key).is_file() {
            return Ok(true);
        }
        Ok(self.archive.keys()?.contains(key))
    }

    /// Number of distinct keys with a record.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.keys()?.len())
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Folds all loose records into the archive.
    ///
    /// Archive members not shadowed by a loose record are first extracted to
    /// loose files, then every loose file is packed into a fresh archive that
    /// replaces the old one by rename, and finally the loose files are
    /// deleted. A failure before the rename leaves the store as it was, apart
    /// from extracted members which hold the same bytes as their archived
    /// copies. With no loose records this is a no-op.
    pub fn compact(&mut self) -> Result<CompactionReport, StoreError> {
        let loose_before = self.loose_keys()?;
        if loose_before.is_empty() {
            return Ok(CompactionReport::default());
        }

        let unshadowed = self.archive.read_all_except(&loose_before)?;
        let extracted = unshadowed.len();
        for (key, bytes) in &unshadowed {
            self.write_loose(key, bytes)?;
        }

        let to_archive = self.loose_keys()?;
        self.archive.rewrite_from(&self.loose, &to_archive)?;

        let mut removed = 0;
        for key in &to_archive {
            let path = self.loose_path(key);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&path)(e)),
            }
        }

        Ok(CompactionReport {
            loose_before: loose_before.len(),
            extracted,
            archived: to_archive.len(),
            removed,
        })
    }
}

fn with_store_suffix(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == STORE_SUFFIX) {
        path.to_path_buf()
    } else {
        let mut name = path.as_os_str().to_os_string();
        name.push(".");
        name.push(STORE_SUFFIX);
        PathBuf::from(name)
    }
}
