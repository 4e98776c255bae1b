//! The compacted, gzip-compressed tar tier of the store.
//!
//! Members are named by cache key and hold exactly the bytes a loose entry
//! would hold. Rewrites go to a temporary file that is renamed over the old
//! archive, so a crash mid-compaction leaves the previous archive intact.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tessera_common::CacheKey;

use crate::error::StoreError;

/// Name of the archive file within the store directory.
pub const ARCHIVE_FILE: &str = "archive.tar.gz";

/// Handle on the archive file of one store.
#[derive(Debug, Clone)]
pub(crate) struct Archive {
    path: PathBuf,
}

impl Archive {
    pub(crate) fn new(store_dir: &Path) -> Self {
        Self {
            path: store_dir.join(ARCHIVE_FILE),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Visits every member whose name is a valid key. Stops early when the
    /// visitor returns `false`.
    fn visit<F>(&self, mut visitor: F) -> Result<(), StoreError>
    where
        F: FnMut(CacheKey, &mut dyn Read) -> Result<bool, StoreError>,
    {
        if !self.exists() {
            return Ok(());
        }
        let file = File::open(&self.path).map_err(StoreError::io(&self.path))?;
        let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
        let entries = archive.entries().map_err(StoreError::io(&self.path))?;
        for entry in entries {
            let mut entry = entry.map_err(StoreError::io(&self.path))?;
            let name = entry.path().map_err(StoreError::io(&self.path))?;
            let Some(key) = name.to_str().and_then(|s| CacheKey::parse(s).ok()) else {
                continue;
            };
            if !visitor(key, &mut entry)? {
                break;
            }
        }
        Ok(())
    }

    /// Names of all keyed members.
    pub(crate) fn keys(&self) -> Result<BTreeSet<CacheKey>, StoreError> {
        let mut keys = BTreeSet::new();
        self.visit(|key, _| {
            keys.insert(key);
            Ok(true)
        })?;
        Ok(keys)
    }

    /// Raw bytes of one member, if present.
    pub(crate) fn read(&self, wanted: &CacheKey) -> Result<Option<Vec<u8>>, StoreError> {
        let mut found = None;
        self.visit(|key, reader| {
            if &key != wanted {
                return Ok(true);
            }
            let mut bytes = Vec::new();
            reader
                .read_to_end(&mut bytes)
                .map_err(StoreError::io(&self.path))?;
            found = Some(bytes);
            Ok(false)
        })?;
        Ok(found)
    }

    /// Raw bytes of every member not in `skip`.
    pub(crate) fn read_all_except(
        &self,
        skip: &BTreeSet<CacheKey>,
    ) -> Result<BTreeMap<CacheKey, Vec<u8>>, StoreError> {
        let mut members = BTreeMap::new();
        self.visit(|key, reader| {
            if !skip.contains(&key) {
                let mut bytes = Vec::new();
                reader
                    .read_to_end(&mut bytes)
                    .map_err(StoreError::io(&self.path))?;
                members.insert(key, bytes);
            }
            Ok(true)
        })?;
        Ok(members)
    }

    /// Replaces the archive with one member per loose file in `keys`.
    pub(crate) fn rewrite_from(
        &self,
        loose_dir: &Path,
        keys: &BTreeSet<CacheKey>,
    ) -> Result<(), StoreError> {
        let tmp = self.path.with_extension(format!("gz.{}.tmp", std::process::id()));
        let result = self.write_to(&tmp, loose_dir, keys);
        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        std::fs::rename(&tmp, &self.path).map_err(StoreError::io(&self.path))
    }

    fn write_to(
        &self,
        target: &Path,
        loose_dir: &Path,
        keys: &BTreeSet<CacheKey>,
    ) -> Result<(), StoreError> {
        let file = File::create(target).map_err(StoreError::io(target))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for key in keys {
            let source = loose_dir.join(key.as_str());
            let bytes = std::fs::read(&source).map_err(StoreError::io(&source))?;
            let mut header = tar::Header::new_gnu();
            header
                .set_path(key.as_str())
                .map_err(StoreError::io(target))?;
            header.set_size(bytes.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append(&header, bytes.as_slice())
                .map_err(StoreError::io(target))?;
        }

        let encoder = builder.into_inner().map_err(StoreError::io(target))?;
        let mut writer = encoder.finish().map_err(StoreError::io(target))?;
        writer.flush().map_err(StoreError::io(target))?;
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::io(target)(e.into_error()))?;
        file.sync_all().map_err(StoreError::io(target))
    }
}
