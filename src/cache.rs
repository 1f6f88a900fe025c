//! The persisted sync cache: the last-fetched remote manifest plus, once a
//! full local scan has completed, the local file metadata for the current
//! target directory.
//!
//! The on-disk format is an opaque binary blob, replaced wholesale on every
//! save (temp file + rename). An older release persisted a JSON text format;
//! that is detected by its delimiters and discarded rather than migrated,
//! forcing a full local rehash.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::SyncResult;
use crate::local::LocalIndex;
use crate::manifest::Manifest;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheData {
    manifest: Manifest,
    manifest_last_modified: Option<DateTime<Utc>>,
    manifest_generated_at: Option<String>,
    /// Set only after a full local scan completed under this directory.
    local_directory: Option<PathBuf>,
    local_files: LocalIndex,
}

pub struct SyncCache {
    path: PathBuf,
    data: CacheData,
    /// Manifest that was current before the last fetch of this run. Never
    /// persisted; the deletion workflow uses it to avoid removing files the
    /// user added out-of-band.
    previous_manifest: Option<Manifest>,
}

impl SyncCache {
    /// Loads the cache, treating every failure mode as an absent cache.
    /// Cached local file info is discarded when it was recorded under a
    /// different target directory; the remote manifest is kept either way.
    pub fn load(path: &Path, configured_dir: &Path) -> Self {
        let mut cache = Self {
            path: path.to_path_buf(),
            data: CacheData::default(),
            previous_manifest: None,
        };

        let Ok(bytes) = std::fs::read(path) else {
            return cache;
        };

        if bytes.first() == Some(&b'{') && bytes.last() == Some(&b'}') {
            tracing::warn!(
                "your local cache format is outdated and needs to be rebuilt; \
                 hashing could take a while, this only needs to be done once"
            );
            let _ = std::fs::remove_file(path);
            return cache;
        }

        match bincode::deserialize::<CacheData>(&bytes) {
            Ok(mut data) => {
                if data.local_directory.as_deref() != Some(configured_dir) {
                    data.local_directory = None;
                    data.local_files = LocalIndex::default();
                }
                tracing::debug!(
                    "loaded {} remote hashes and {} local hashes from cache",
                    data.manifest.len(),
                    data.local_files.len()
                );
                cache.data = data;
            }
            Err(err) => {
                tracing::warn!("could not read the local cache, it will be rebuilt: {err}");
            }
        }
        cache
    }

    /// Persists the cache as a full-file replace.
    pub fn save(&self) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = bincode::serialize(&self.data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn manifest(&self) -> &Manifest {
        &self.data.manifest
    }

    pub fn manifest_last_modified(&self) -> Option<DateTime<Utc>> {
        self.data.manifest_last_modified
    }

    pub fn manifest_generated_at(&self) -> Option<&str> {
        self.data.manifest_generated_at.as_deref()
    }

    pub fn previous_manifest(&self) -> Option<&Manifest> {
        self.previous_manifest.as_ref()
    }

    /// Replaces the cached manifest after a successful fetch, retaining the
    /// old one in memory for the deletion workflow.
    pub fn install_manifest(
        &mut self,
        manifest: Manifest,
        last_modified: Option<DateTime<Utc>>,
        generated_at: Option<String>,
    ) {
        let old = std::mem::replace(&mut self.data.manifest, manifest);
        if !old.is_empty() {
            self.previous_manifest = Some(old);
        }
        self.data.manifest_last_modified = last_modified;
        self.data.manifest_generated_at = generated_at;
    }

    pub fn local_files(&self) -> &LocalIndex {
        &self.data.local_files
    }

    pub fn local_files_mut(&mut self) -> &mut LocalIndex {
        &mut self.data.local_files
    }

    /// Takes the index out for a scan pass (avoids holding `&mut self`
    /// across the blocking hash work).
    pub fn take_local_files(&mut self) -> LocalIndex {
        std::mem::take(&mut self.data.local_files)
    }

    pub fn restore_local_files(&mut self, index: LocalIndex) {
        self.data.local_files = index;
    }

    /// Records that a full scan completed under `dir`, which makes the local
    /// side of the cache eligible for persistence.
    pub fn mark_local_scan_complete(&mut self, dir: &Path) {
        self.data.local_directory = Some(dir.to_path_buf());
    }
}
