use std::path::Path;

use serde::{Deserialize, Serialize};

use cadenza_plugin_sdk::ModuleMetadata;

/// Persisted record for one plugin file: its identity stamp plus the
/// modules it exported the last time it was opened.
///
/// The record is trustworthy only while `(size, mtime)` still equal the
/// live stat of `path`; any mismatch forces a re-open on the next scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    /// Set when the file failed to open or validate. Junk entries are
    /// skipped for the rest of the run and retried on the next one.
    pub junk: bool,
    pub modules: Vec<ModuleMetadata>,
}

impl CacheEntry {
    pub fn new(path: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            path: path.into(),
            size,
            mtime,
            junk: false,
            modules: Vec::new(),
        }
    }

    pub fn junk(path: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            junk: true,
            ..Self::new(path, size, mtime)
        }
    }

    pub fn with_modules(mut self, modules: Vec<ModuleMetadata>) -> Self {
        self.modules = modules;
        self
    }

    /// Whether this entry still describes the file with the given stat.
    pub fn matches(&self, size: u64, mtime: i64) -> bool {
        self.size == size && self.mtime == mtime
    }

    pub fn file_path(&self) -> &Path {
        Path::new(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn entry_roundtrip() {
        let entry = CacheEntry::new("/usr/lib/cadenza/plugins/libflac.so", 1024, 1_700_000_000)
            .with_modules(vec![ModuleMetadata::new("flac", "FLAC demuxer", "demux", 100)]);
        let json = serde_json::to_string(&entry).unwrap();
        let roundtrip: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(roundtrip, entry);
    }

    #[test]
    fn matches_requires_both_size_and_mtime() {
        let entry = CacheEntry::new("/p", 10, 20);
        assert!(entry.matches(10, 20));
        assert!(!entry.matches(11, 20));
        assert!(!entry.matches(10, 21));
    }
}
