//! Standalone scanner that refreshes the Cadenza plugin cache from the
//! command line, without starting the rest of the framework.

use std::path::PathBuf;

use anyhow::Result;

use cadenza_module_bank::{
    BankConfig, ModuleBank, ModuleDescriptor, ScanConfig, ScanStats,
};

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Additional directories scanned after the default roots.
    pub extra_paths: Vec<PathBuf>,
    /// Only scan the explicitly given paths.
    pub skip_default_paths: bool,
    /// Cache file override; `None` uses the per-user default.
    pub cache_path: Option<PathBuf>,
    /// Force a full rescan and skip saving.
    pub no_cache: bool,
    /// Delete the cache file before scanning.
    pub invalidate: bool,
}

pub struct ScanReport {
    pub modules: Vec<ModuleDescriptor>,
    pub stats: ScanStats,
}

pub struct Scanner {
    bank: ModuleBank,
    invalidate: bool,
}

impl Scanner {
    pub fn new(options: &ScanOptions) -> Self {
        let mut scan = if options.skip_default_paths {
            ScanConfig {
                directories: Vec::new(),
                ..ScanConfig::default()
            }
        } else {
            ScanConfig::default()
        };
        scan.directories.extend(options.extra_paths.iter().cloned());
        let bank = ModuleBank::new(BankConfig {
            scan,
            cache_path: options.cache_path.clone(),
            use_cache: !options.no_cache,
        });
        Self {
            bank,
            invalidate: options.invalidate,
        }
    }

    /// Run the scan, returning the discovered descriptors and the
    /// cache counters. The reconciled cache is flushed before
    /// returning so the next framework start takes the fast path.
    pub fn scan(&self) -> Result<ScanReport> {
        if self.invalidate {
            tracing::info!("deleting plugin cache before scan");
            self.bank.invalidate_cache();
        }
        let stats = self.bank.load_plugins();
        tracing::info!(
            files = stats.files_seen,
            cache_hits = stats.cache_hits,
            opened = stats.opened,
            junk = stats.junk,
            "plugin scan finished"
        );
        self.bank.flush_cache();
        Ok(ScanReport {
            modules: self.bank.modules(),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn empty_directory_scans_to_nothing() {
        let dir = tempdir().unwrap();
        let options = ScanOptions {
            extra_paths: vec![dir.path().join("plugins")],
            skip_default_paths: true,
            cache_path: Some(dir.path().join("plugins.json")),
            ..ScanOptions::default()
        };
        let report = Scanner::new(&options).scan().unwrap();
        assert!(report.modules.is_empty());
        assert_eq!(report.stats.files_seen, 0);
    }

    #[test]
    fn invalidate_removes_a_previous_cache_file() {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("plugins.json");
        std::fs::write(&cache, "{}").unwrap();
        let options = ScanOptions {
            extra_paths: vec![dir.path().join("plugins")],
            skip_default_paths: true,
            cache_path: Some(cache.clone()),
            invalidate: true,
            ..ScanOptions::default()
        };
        let report = Scanner::new(&options).scan().unwrap();
        assert!(report.modules.is_empty());
        assert!(!cache.exists());
    }
}
