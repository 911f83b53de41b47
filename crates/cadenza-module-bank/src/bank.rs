use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use cadenza_plugin_db::{CacheEntry, CacheStore};
use cadenza_plugin_sdk::{ActivationContext, ModuleActivation, ModuleMetadata, ModuleRegistration};

use crate::cpu::CpuFeatures;
use crate::descriptor::{ModuleDescriptor, ModuleId, ModuleRegistry};
use crate::error::{LoadError, NeedError};
use crate::loader::{DynamicLoader, LoadedObject, LoadedPlugin, PluginLoader};
use crate::resolver::{self, ShortcutRequest};
use crate::scanner::{self, ScanConfig, ScanStats, ScannedSource};

/// Number of times a module may drop to zero references before its
/// backing object is unloaded. The hysteresis keeps modules that are
/// acquired and released in rapid succession (once per demuxed packet,
/// say) from thrashing the dynamic linker.
pub const IDLE_UNLOAD_THRESHOLD: u32 = 32;

/// Construction parameters for a [`ModuleBank`].
#[derive(Debug, Clone)]
pub struct BankConfig {
    pub scan: ScanConfig,
    /// Cache file location; `None` uses the per-user default path.
    pub cache_path: Option<PathBuf>,
    /// Disabling the cache forces a full open of every plugin file on
    /// each scan and suppresses the shutdown save.
    pub use_cache: bool,
}

impl Default for BankConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            cache_path: None,
            use_cache: true,
        }
    }
}

#[derive(Default)]
struct BankState {
    registry: ModuleRegistry,
    cache: Vec<CacheEntry>,
    builtins_loaded: bool,
    plugins_loaded: bool,
}

/// Reference to an activated module, returned by [`ModuleBank::need`]
/// and consumed by [`ModuleBank::unneed`].
pub struct ModuleHandle {
    id: ModuleId,
    short_name: String,
    capability: String,
    activation: Arc<dyn ModuleActivation>,
}

impl ModuleHandle {
    pub fn module(&self) -> ModuleId {
        self.id
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("module", &self.id)
            .field("short_name", &self.short_name)
            .field("capability", &self.capability)
            .finish()
    }
}

/// Process-wide module registry, plugin cache, and lifecycle manager.
///
/// One bank exists per process, owned by whoever bootstraps the
/// framework and passed by reference to every subsystem; tests build as
/// many independent banks as they like. All operations are safe under
/// concurrent invocation: a single bank lock guards the registry and
/// per-module counters, while dynamic-library opens and the
/// activate/deactivate callbacks always run outside it, so a module's
/// activation may recursively acquire further modules.
pub struct ModuleBank {
    state: Mutex<BankState>,
    store: Option<CacheStore>,
    scan_config: ScanConfig,
    cpu: CpuFeatures,
    loader: Arc<dyn PluginLoader>,
}

impl ModuleBank {
    pub fn new(config: BankConfig) -> Self {
        Self::with_loader(config, Arc::new(DynamicLoader))
    }

    /// Build a bank with a custom plugin loader. The seam exists for
    /// tests and for embedders with unusual linking requirements.
    pub fn with_loader(config: BankConfig, loader: Arc<dyn PluginLoader>) -> Self {
        let store = if config.use_cache {
            match config.cache_path.map(Ok).unwrap_or_else(CacheStore::default_path) {
                Ok(path) => Some(CacheStore::open(path)),
                Err(err) => {
                    log::warn!("plugin cache disabled: {err}");
                    None
                }
            }
        } else {
            None
        };
        Self {
            state: Mutex::new(BankState::default()),
            store,
            scan_config: config.scan,
            cpu: CpuFeatures::detect(),
            loader,
        }
    }

    pub fn cpu(&self) -> CpuFeatures {
        self.cpu
    }

    /// Register the built-in modules. Built-ins are resident for the
    /// life of the bank and are never unloaded. The bank accepts one
    /// built-in set; further calls are ignored.
    pub fn load_builtins(&self, builtins: Vec<ModuleRegistration>) {
        let mut state = self.state.lock();
        if state.builtins_loaded {
            log::warn!("built-in modules already loaded");
            return;
        }
        state.builtins_loaded = true;
        for builtin in builtins {
            state.registry.register_builtin(builtin);
        }
    }

    /// Scan the plugin directories, reconciling against the persisted
    /// cache, and register everything discovered. A no-op once the
    /// plugins are loaded; [`ModuleBank::reset`] repopulates.
    pub fn load_plugins(&self) -> ScanStats {
        {
            let mut state = self.state.lock();
            if state.plugins_loaded {
                log::debug!("plugins already loaded");
                return ScanStats::default();
            }
            state.plugins_loaded = true;
        }
        let previous = self
            .store
            .as_ref()
            .map(|store| store.load())
            .unwrap_or_default();
        let result = scanner::scan(&self.scan_config, &previous, self.loader.as_ref());
        let stats = result.stats;
        {
            let mut state = self.state.lock();
            for plugin in result.plugins {
                match plugin.source {
                    ScannedSource::Described(modules) => {
                        state.registry.register_cached(&modules, &plugin.path);
                    }
                    ScannedSource::Resident {
                        registrations,
                        object,
                    } => {
                        for registration in registrations {
                            state.registry.register_plugin(
                                registration,
                                &plugin.path,
                                Some(object.clone()),
                            );
                        }
                    }
                }
            }
            state.cache = result.cache;
        }
        if result.dirty {
            if let Some(store) = &self.store {
                store.mark_dirty();
            }
        }
        log::info!(
            "plugin scan: {} files, {} cache hits, {} opened, {} junk",
            stats.files_seen,
            stats.cache_hits,
            stats.opened,
            stats.junk
        );
        stats
    }

    /// Revoke all unreferenced plugin modules and rescan the plugin
    /// directories. Built-ins are untouched; modules still referenced
    /// by outstanding handles stay valid and are logged.
    pub fn reset(&self) -> ScanStats {
        let dropped = {
            let mut state = self.state.lock();
            state.plugins_loaded = false;
            let ids: Vec<ModuleId> = state
                .registry
                .iter()
                .filter(|(_, slot)| !slot.descriptor.builtin && !slot.revoked)
                .map(|(id, _)| id)
                .collect();
            let mut dropped = Vec::new();
            for id in ids {
                let slot = state.registry.slot_mut(id);
                if slot.refcount > 0 {
                    log::warn!(
                        "module \"{}\" still referenced across reset",
                        slot.descriptor.short_name()
                    );
                    continue;
                }
                slot.revoked = true;
                dropped.push((slot.activation.take(), slot.resident.take()));
            }
            dropped
        };
        drop(dropped);
        self.load_plugins()
    }

    /// Acquire an implementation of `capability`.
    ///
    /// `name` selects candidates: `"any"` (or empty) ranks by score
    /// alone, `"none"` matches nothing, and a comma-separated shortcut
    /// list names modules in preference order. Under `strict`, a
    /// request that no module's shortcuts satisfy fails rather than
    /// falling back to the highest-scored candidate.
    ///
    /// Candidates are tried best first: the backing object is loaded if
    /// necessary, `activate` runs, and the first success is returned.
    /// An activation failure moves on to the next candidate.
    pub fn need(
        &self,
        ctx: &ActivationContext,
        capability: &str,
        name: &str,
        strict: bool,
    ) -> Result<ModuleHandle, NeedError> {
        let (shortcuts, strict) = match ShortcutRequest::parse(name, strict) {
            ShortcutRequest::RefuseAll => return Err(self.no_such(capability, name)),
            ShortcutRequest::Select { shortcuts, strict } => (shortcuts, strict),
        };

        let candidates = {
            let state = self.state.lock();
            resolver::resolve(&state.registry, capability, &shortcuts, strict, self.cpu)
        };
        log::debug!(
            "looking for {} module: {} candidate{}",
            capability,
            candidates.len(),
            if candidates.len() == 1 { "" } else { "s" }
        );
        if candidates.is_empty() {
            return Err(self.no_such(capability, name));
        }

        for candidate in &candidates {
            let (activation, short_name) = match self.reserve(candidate.id) {
                Ok(reserved) => reserved,
                Err(err) => {
                    log::warn!("cannot load {capability} candidate: {err}");
                    continue;
                }
            };
            match activation.activate(ctx) {
                Ok(()) => {
                    log::debug!("using {capability} module \"{short_name}\"");
                    return Ok(ModuleHandle {
                        id: candidate.id,
                        short_name,
                        capability: capability.to_owned(),
                        activation,
                    });
                }
                Err(err) => {
                    log::debug!("module \"{short_name}\" activation failed: {err}");
                    // a failed activate may have left partial state;
                    // deactivate gets a chance to tear it down
                    activation.deactivate(ctx);
                    drop(activation);
                    self.release(candidate.id);
                }
            }
        }

        Err(NeedError::ActivationFailed {
            capability: capability.to_owned(),
            name: display_name(name).to_owned(),
        })
    }

    /// Release a handle obtained from [`ModuleBank::need`].
    ///
    /// Deactivates the module and decrements its reference count. The
    /// backing object is not unloaded immediately: each drop to zero
    /// references counts one idle hit, and only past
    /// [`IDLE_UNLOAD_THRESHOLD`] is the object actually unloaded.
    pub fn unneed(&self, ctx: &ActivationContext, handle: ModuleHandle) {
        let ModuleHandle {
            id,
            short_name,
            activation,
            ..
        } = handle;
        activation.deactivate(ctx);
        log::debug!("removing module \"{short_name}\"");
        drop(activation);
        self.release(id);
    }

    /// Look up a module by short name.
    pub fn find(&self, name: &str) -> Option<ModuleId> {
        let state = self.state.lock();
        let found = state
            .registry
            .iter()
            .find(|(_, slot)| !slot.revoked && slot.descriptor.short_name() == name)
            .map(|(id, _)| id);
        found
    }

    pub fn exists(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// `(short_name, long_name)` of every module offering `capability`,
    /// in registration order.
    pub fn names_for_capability(&self, capability: &str) -> Vec<(String, String)> {
        let state = self.state.lock();
        state
            .registry
            .iter()
            .filter(|(_, slot)| !slot.revoked && slot.descriptor.capability() == capability)
            .map(|(_, slot)| {
                (
                    slot.descriptor.metadata.short_name.clone(),
                    slot.descriptor.metadata.long_name.clone(),
                )
            })
            .collect()
    }

    pub fn descriptor(&self, id: ModuleId) -> ModuleDescriptor {
        self.state.lock().registry.slot(id).descriptor.clone()
    }

    /// Whether the module's callbacks are currently resident.
    pub fn is_loaded(&self, id: ModuleId) -> bool {
        self.state.lock().registry.slot(id).is_loaded()
    }

    pub fn module_count(&self) -> usize {
        let state = self.state.lock();
        state.registry.iter().filter(|(_, slot)| !slot.revoked).count()
    }

    /// Snapshot of every registered descriptor, in registration order.
    pub fn modules(&self) -> Vec<ModuleDescriptor> {
        let state = self.state.lock();
        state
            .registry
            .iter()
            .filter(|(_, slot)| !slot.revoked)
            .map(|(_, slot)| slot.descriptor.clone())
            .collect()
    }

    /// Write the reconciled cache back to disk if anything changed.
    /// Failures are logged and swallowed; the next run simply rescans.
    pub fn flush_cache(&self) {
        let Some(store) = &self.store else { return };
        if !store.is_dirty() {
            return;
        }
        let entries = self.state.lock().cache.clone();
        if let Err(err) = store.save(&entries) {
            log::warn!("failed to save plugin cache: {err}");
        }
    }

    /// Delete the on-disk cache. Recovery path for persistent
    /// corruption; the next run rescans from scratch.
    pub fn invalidate_cache(&self) {
        if let Some(store) = &self.store {
            if let Err(err) = store.invalidate() {
                log::warn!("failed to delete plugin cache: {err}");
            }
        }
    }

    /// Tear the bank down, flushing the cache and unloading every
    /// plugin object.
    pub fn end(self) {}

    fn no_such(&self, capability: &str, name: &str) -> NeedError {
        log::info!(
            "no {} module matched \"{}\"",
            capability,
            display_name(name)
        );
        NeedError::NoSuchCapability {
            capability: capability.to_owned(),
            name: display_name(name).to_owned(),
        }
    }

    /// Ensure the module's callbacks are resident and take a reference
    /// on it, loading the backing object if needed.
    ///
    /// The load runs outside the bank lock; a check-lock-check on
    /// re-entry guarantees at most one mapping per file even when two
    /// threads race, with the loser's redundant handle discarded.
    fn reserve(&self, id: ModuleId) -> Result<(Arc<dyn ModuleActivation>, String), LoadError> {
        loop {
            let path = {
                let mut state = self.state.lock();
                let slot = state.registry.slot_mut(id);
                if let Some(activation) = slot.activation.clone() {
                    slot.refcount += 1;
                    return Ok((activation, slot.descriptor.short_name().to_owned()));
                }
                match slot.descriptor.backing_file.clone() {
                    Some(path) => path,
                    None => {
                        // built-ins always carry callbacks; a bare slot
                        // without a file cannot be made loadable
                        return Err(LoadError::MissingBinary(PathBuf::from(
                            slot.descriptor.short_name(),
                        )));
                    }
                }
            };

            let loaded = self.loader.load(&path)?;

            let redundant = {
                let mut state = self.state.lock();
                if state.registry.slot(id).activation.is_some() {
                    Some(loaded)
                } else {
                    self.install_loaded(&mut state, &path, loaded);
                    if state.registry.slot(id).activation.is_none() {
                        // the file no longer exports this module; the
                        // cache predicted wrong
                        return Err(LoadError::NoModules(path));
                    }
                    None
                }
            };
            // a redundant mapping is closed here, outside the lock
            drop(redundant);
        }
    }

    /// Install freshly loaded callbacks into the cached slots of one
    /// file. Runs under the bank lock.
    fn install_loaded(&self, state: &mut BankState, path: &Path, loaded: LoadedPlugin) {
        let object = Arc::new(loaded.object);
        let slot_ids = state.registry.slots_for_file(path);
        let mut mismatch = false;

        for (metadata, activation) in flatten_registrations(loaded.registrations) {
            let matched = slot_ids.iter().copied().find(|&sid| {
                let slot = state.registry.slot(sid);
                slot.activation.is_none()
                    && slot.descriptor.short_name() == metadata.short_name
                    && slot.descriptor.capability() == metadata.capability
            });
            match matched {
                Some(sid) => {
                    let slot = state.registry.slot_mut(sid);
                    slot.activation = Some(activation);
                    slot.resident = Some(object.clone());
                    slot.idle_hits = 0;
                }
                None => {
                    log::warn!(
                        "plugin {} exports unexpected module \"{}\"",
                        path.display(),
                        metadata.short_name
                    );
                    mismatch = true;
                }
            }
        }

        for &sid in &slot_ids {
            if state.registry.slot(sid).activation.is_none() {
                log::warn!(
                    "plugin {} no longer exports module \"{}\"",
                    path.display(),
                    state.registry.slot(sid).descriptor.short_name()
                );
                mismatch = true;
            }
        }

        if mismatch {
            if let Some(store) = &self.store {
                store.mark_dirty();
            }
        }
    }

    /// Drop one reference; on reaching zero, count an idle hit and
    /// unload the backing object once past the threshold.
    fn release(&self, id: ModuleId) {
        let dropped = {
            let mut state = self.state.lock();
            let slot = state.registry.slot_mut(id);
            slot.refcount = slot.refcount.saturating_sub(1);
            if slot.refcount > 0 {
                Vec::new()
            } else {
                slot.idle_hits += 1;
                if slot.idle_hits > IDLE_UNLOAD_THRESHOLD {
                    Self::unload_if_idle(&mut state, id)
                } else {
                    Vec::new()
                }
            }
        };
        // dlclose of the dropped objects happens outside the bank lock
        drop(dropped);
    }

    /// Unload the file backing `id` if every module sharing it is
    /// unreferenced and unloadable. Returns the ownership to drop once
    /// the lock is released.
    #[allow(clippy::type_complexity)]
    fn unload_if_idle(
        state: &mut BankState,
        id: ModuleId,
    ) -> Vec<(Option<Arc<dyn ModuleActivation>>, Option<Arc<LoadedObject>>)> {
        let slot = state.registry.slot(id);
        if !slot.descriptor.unloadable() || !slot.is_loaded() {
            return Vec::new();
        }
        let Some(path) = slot.descriptor.backing_file.clone() else {
            return Vec::new();
        };
        let siblings = state.registry.slots_for_file(&path);
        let pinned_or_busy = siblings.iter().any(|&sid| {
            let sibling = state.registry.slot(sid);
            sibling.refcount > 0 || !sibling.descriptor.unloadable()
        });
        if pinned_or_busy {
            return Vec::new();
        }

        log::debug!("unloading plugin {}", path.display());
        let mut dropped = Vec::new();
        for sid in siblings {
            let slot = state.registry.slot_mut(sid);
            // activation before object: callbacks live inside the
            // mapped file and must be dropped first
            dropped.push((slot.activation.take(), slot.resident.take()));
            slot.idle_hits = 0;
        }
        dropped
    }
}

impl Drop for ModuleBank {
    fn drop(&mut self) {
        self.flush_cache();
    }
}

fn display_name(name: &str) -> &str {
    if name.trim().is_empty() {
        "any"
    } else {
        name
    }
}

fn flatten_registrations(
    registrations: Vec<ModuleRegistration>,
) -> Vec<(ModuleMetadata, Arc<dyn ModuleActivation>)> {
    let mut out = Vec::new();
    for registration in registrations {
        let ModuleRegistration {
            metadata,
            activation,
            submodules,
        } = registration;
        out.push((metadata, activation));
        out.extend(flatten_registrations(submodules));
    }
    out
}
