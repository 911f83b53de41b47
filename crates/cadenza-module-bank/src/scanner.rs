use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use walkdir::WalkDir;

use cadenza_plugin_db::CacheEntry;
use cadenza_plugin_sdk::{ModuleMetadata, ModuleRegistration};

use crate::loader::{LoadedObject, LoadedPlugin, PluginLoader};

/// Where and how deep to look for plugin shared objects.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Search roots, scanned in order. Within a root, files are visited
    /// in lexicographic order so registration order is reproducible.
    pub directories: Vec<PathBuf>,
    pub max_depth: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        let mut directories = vec![PathBuf::from("/usr/lib/cadenza/plugins")];
        if let Some(home) = dirs::home_dir() {
            directories.push(home.join(".cadenza/plugins"));
        }
        Self {
            directories,
            max_depth: 5,
        }
    }
}

/// Counters exposed for operator logging and for the cache fast-path
/// tests: an unchanged file must bump `cache_hits` and never `opened`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub files_seen: usize,
    pub cache_hits: usize,
    pub opened: usize,
    pub junk: usize,
    pub removed: usize,
}

/// How one scanned file's modules were obtained.
pub enum ScannedSource {
    /// Metadata only, no callbacks: either adopted from a matching
    /// cache entry, or extracted from a fresh open whose object was
    /// closed again. The backing object is reloaded lazily on first
    /// use.
    Described(Vec<ModuleMetadata>),
    /// Freshly opened with at least one pinned module; the object
    /// stays mapped and the registrations keep their callbacks.
    Resident {
        registrations: Vec<ModuleRegistration>,
        object: Arc<LoadedObject>,
    },
}

pub struct ScannedPlugin {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: i64,
    pub source: ScannedSource,
}

pub struct ScanResult {
    pub plugins: Vec<ScannedPlugin>,
    /// Reconciled cache: one entry per file present on disk, junk
    /// entries included, vanished files dropped.
    pub cache: Vec<CacheEntry>,
    pub stats: ScanStats,
    /// Whether the reconciled cache differs from the previous one.
    pub dirty: bool,
}

/// Walk the plugin directories and reconcile disk state against the
/// previous cache.
///
/// Unchanged files (same size and mtime, not junk) adopt their cached
/// descriptors without touching the dynamic linker. Changed, new, and
/// previously junk files are opened through `loader`; open or
/// validation failures mark the file junk and the scan continues.
pub fn scan(config: &ScanConfig, previous: &[CacheEntry], loader: &dyn PluginLoader) -> ScanResult {
    let previous_by_path: HashMap<&str, &CacheEntry> = previous
        .iter()
        .map(|entry| (entry.path.as_str(), entry))
        .collect();

    let mut plugins = Vec::new();
    let mut cache = Vec::new();
    let mut stats = ScanStats::default();
    let mut seen: HashSet<PathBuf> = HashSet::new();

    for dir in &config.directories {
        if !dir.is_dir() {
            continue;
        }
        log::debug!("recursively browsing {}", dir.display());
        let walker = WalkDir::new(dir)
            .max_depth(config.max_depth)
            .sort_by_file_name()
            .into_iter();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::debug!("skipping entry under {}: {err}", dir.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_plugin_file(entry.path()) {
                continue;
            }
            let path = entry.path().to_path_buf();
            if !seen.insert(path.clone()) {
                continue;
            }
            let (size, mtime) = match file_stamp(&path) {
                Ok(stamp) => stamp,
                Err(err) => {
                    log::warn!("cannot stat {}: {err}", path.display());
                    continue;
                }
            };
            stats.files_seen += 1;

            let path_str = path.display().to_string();
            if let Some(prev) = previous_by_path.get(path_str.as_str()) {
                if !prev.junk && prev.matches(size, mtime) {
                    stats.cache_hits += 1;
                    plugins.push(ScannedPlugin {
                        path,
                        size,
                        mtime,
                        source: ScannedSource::Described(prev.modules.clone()),
                    });
                    cache.push((*prev).clone());
                    continue;
                }
            }

            stats.opened += 1;
            match loader.load(&path) {
                Ok(loaded) => {
                    let metadata = collect_metadata(&loaded.registrations);
                    let pinned = metadata.iter().any(|m| !m.unloadable);
                    cache.push(
                        CacheEntry::new(path_str, size, mtime)
                            .with_modules(metadata.clone()),
                    );
                    let source = if pinned {
                        ScannedSource::Resident {
                            registrations: loaded.registrations,
                            object: Arc::new(loaded.object),
                        }
                    } else {
                        // close the object again; its callbacks resolve
                        // into the mapping, so they must go first
                        let LoadedPlugin {
                            registrations,
                            object,
                        } = loaded;
                        drop(registrations);
                        drop(object);
                        ScannedSource::Described(metadata)
                    };
                    plugins.push(ScannedPlugin {
                        path,
                        size,
                        mtime,
                        source,
                    });
                }
                Err(err) => {
                    log::warn!("skipping plugin {}: {err}", path.display());
                    stats.junk += 1;
                    cache.push(CacheEntry::junk(path_str, size, mtime));
                }
            }
        }
    }

    stats.removed = previous
        .iter()
        .filter(|entry| !seen.contains(entry.file_path()))
        .count();

    let dirty = stats.opened > 0 || stats.removed > 0;
    ScanResult {
        plugins,
        cache,
        stats,
        dirty,
    }
}

fn is_plugin_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(std::env::consts::DLL_EXTENSION))
}

fn file_stamp(path: &Path) -> std::io::Result<(u64, i64)> {
    let metadata = std::fs::metadata(path)?;
    let mtime = match metadata.modified()?.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    };
    Ok((metadata.len(), mtime))
}

fn collect_metadata(registrations: &[ModuleRegistration]) -> Vec<ModuleMetadata> {
    registrations
        .iter()
        .flat_map(|registration| registration.flattened())
        .map(|registration| registration.metadata.clone())
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use cadenza_plugin_sdk::{
        ActivationContext, ActivationError, ModuleActivation, ModuleMetadata, ModuleRegistration,
    };

    use crate::error::LoadError;
    use crate::loader::{fake_loaded, LoadedPlugin, PluginLoader};

    pub struct Noop;

    impl ModuleActivation for Noop {
        fn activate(&self, _ctx: &ActivationContext) -> Result<(), ActivationError> {
            Ok(())
        }
    }

    /// In-memory stand-in for the dynamic linker: maps file paths to the
    /// registrations they would export and counts every open.
    #[derive(Default)]
    pub struct MapLoader {
        exports: HashMap<PathBuf, Vec<ModuleMetadata>>,
        broken: Vec<PathBuf>,
        pub opens: AtomicUsize,
    }

    impl MapLoader {
        pub fn with_export(mut self, path: impl Into<PathBuf>, modules: Vec<ModuleMetadata>) -> Self {
            self.exports.insert(path.into(), modules);
            self
        }

        pub fn with_broken(mut self, path: impl Into<PathBuf>) -> Self {
            self.broken.push(path.into());
            self
        }

        pub fn open_count(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl PluginLoader for MapLoader {
        fn load(&self, path: &Path) -> Result<LoadedPlugin, LoadError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.broken.iter().any(|p| p == path) {
                return Err(LoadError::MissingEntryPoint(path.to_path_buf()));
            }
            let modules = self
                .exports
                .get(path)
                .ok_or_else(|| LoadError::MissingBinary(path.to_path_buf()))?;
            let mut registrations: Vec<ModuleRegistration> = Vec::new();
            for metadata in modules {
                if metadata.submodule {
                    let parent = registrations
                        .pop()
                        .expect("submodule metadata must follow its parent");
                    registrations.push(parent.with_submodule(ModuleRegistration::new(
                        metadata.clone(),
                        Arc::new(Noop),
                    )));
                } else {
                    registrations.push(ModuleRegistration::new(metadata.clone(), Arc::new(Noop)));
                }
            }
            Ok(fake_loaded(path, registrations))
        }
    }

    pub fn plugin_file_name(stem: &str) -> String {
        format!("{stem}.{}", std::env::consts::DLL_EXTENSION)
    }

    pub fn write_plugin(dir: &Path, stem: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(plugin_file_name(stem));
        std::fs::write(&path, contents).unwrap();
        path
    }
}
