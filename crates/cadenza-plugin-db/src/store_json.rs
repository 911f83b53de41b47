use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entry::CacheEntry;

/// Format revision of the on-disk cache file. Bumped whenever the record
/// layout changes; a mismatch on read is treated as an absent cache.
pub const CACHE_VERSION: u32 = 4;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write plugin cache: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to encode plugin cache: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no config directory available for the plugin cache")]
    NoConfigDir,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFileData {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Versioned JSON store for plugin discovery state.
///
/// Reads fail soft: a missing, corrupt, or version-mismatched file loads
/// as an empty cache and the scanner simply re-opens everything. Writes
/// replace the file atomically so a crash mid-save cannot leave a
/// half-written cache for the next run.
#[derive(Debug)]
pub struct CacheStore {
    path: PathBuf,
    dirty: AtomicBool,
    write_lock: Mutex<()>,
}

impl CacheStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    pub fn default_path() -> Result<PathBuf, StoreError> {
        let mut config_dir = dirs::config_dir().ok_or(StoreError::NoConfigDir)?;
        config_dir.push("cadenza");
        fs::create_dir_all(&config_dir)?;
        config_dir.push("plugins.json");
        Ok(config_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deserialize the previous run's cache. Never fails startup: any
    /// read or parse problem degrades to an empty entry list.
    pub fn load(&self) -> Vec<CacheEntry> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!(
                        "could not read plugin cache {}: {err}",
                        self.path.display()
                    );
                }
                return Vec::new();
            }
        };
        let data: CacheFileData = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(err) => {
                log::warn!(
                    "plugin cache {} is corrupt, rescanning: {err}",
                    self.path.display()
                );
                return Vec::new();
            }
        };
        if data.version != CACHE_VERSION {
            log::info!(
                "plugin cache version {} does not match {}, rescanning",
                data.version,
                CACHE_VERSION
            );
            return Vec::new();
        }
        data.entries
    }

    /// Serialize the current discovery state, replacing the cache file
    /// via write-temp-then-rename. Clears the dirty flag on success.
    pub fn save(&self, entries: &[CacheEntry]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let data = CacheFileData {
            version: CACHE_VERSION,
            entries: entries.to_vec(),
        };
        let json = serde_json::to_string_pretty(&data)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Delete the cache file outright. Recovery path for format changes
    /// or repeated corruption; the next run rescans from scratch.
    pub fn invalidate(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use cadenza_plugin_sdk::ModuleMetadata;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    fn sample_entries() -> Vec<CacheEntry> {
        vec![
            CacheEntry::new("/plugins/liba.so", 100, 1).with_modules(vec![ModuleMetadata::new(
                "a",
                "Module A",
                "access",
                50,
            )]),
            CacheEntry::junk("/plugins/libbad.so", 7, 2),
        ]
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("plugins.json"));
        let entries = sample_entries();
        store.save(&entries).unwrap();
        assert_eq!(store.load(), entries);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("absent.json"));
        assert!(store.load().is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        fs::write(&path, "{not json").unwrap();
        let store = CacheStore::open(&path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn version_mismatch_loads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        let stale = serde_json::json!({ "version": CACHE_VERSION - 1, "entries": [] });
        fs::write(&path, stale.to_string()).unwrap();
        let store = CacheStore::open(&path);
        assert!(store.load().is_empty());
    }

    #[test]
    fn save_replaces_without_leaving_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        let store = CacheStore::open(&path);
        store.save(&sample_entries()).unwrap();
        store.save(&[]).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert!(store.load().is_empty());
    }

    #[test]
    fn dirty_flag_tracks_saves() {
        let dir = tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("plugins.json"));
        assert!(!store.is_dirty());
        store.mark_dirty();
        assert!(store.is_dirty());
        store.save(&[]).unwrap();
        assert!(!store.is_dirty());
    }

    #[test]
    fn invalidate_removes_the_file_and_tolerates_absence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plugins.json");
        let store = CacheStore::open(&path);
        store.save(&sample_entries()).unwrap();
        store.invalidate().unwrap();
        assert!(!path.exists());
        store.invalidate().unwrap();
    }
}
