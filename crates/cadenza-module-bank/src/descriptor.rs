use std::path::{Path, PathBuf};
use std::sync::Arc;

use cadenza_plugin_sdk::{ModuleActivation, ModuleMetadata, ModuleRegistration};

use crate::loader::LoadedObject;

/// Stable identifier of a module within one bank. Identifiers are never
/// reused, so handles stay valid across [`crate::ModuleBank::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub(crate) usize);

/// One loadable implementation unit known to the registry.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub metadata: ModuleMetadata,
    pub builtin: bool,
    /// Shared object the module came from; `None` for built-ins.
    pub backing_file: Option<PathBuf>,
    /// Parent module for submodules sharing the same backing object.
    pub parent: Option<ModuleId>,
}

impl ModuleDescriptor {
    pub fn capability(&self) -> &str {
        &self.metadata.capability
    }

    pub fn short_name(&self) -> &str {
        &self.metadata.short_name
    }

    pub fn score(&self) -> i32 {
        self.metadata.score
    }

    pub fn is_submodule(&self) -> bool {
        self.metadata.submodule
    }

    /// Whether the backing object may ever be unloaded. Built-ins and
    /// pinned modules stay resident for the life of the bank.
    pub fn unloadable(&self) -> bool {
        !self.builtin && self.metadata.unloadable
    }
}

/// Registry slot: descriptor plus the mutable lifecycle state guarded by
/// the bank lock.
///
/// Field order matters for teardown: `activation` must drop before
/// `resident`, since the callbacks live inside the mapped object.
pub(crate) struct ModuleSlot {
    pub descriptor: ModuleDescriptor,
    pub activation: Option<Arc<dyn ModuleActivation>>,
    pub resident: Option<Arc<LoadedObject>>,
    pub refcount: usize,
    pub idle_hits: u32,
    /// Set by `reset` on slots whose backing file is being rescanned;
    /// revoked slots are invisible to resolution.
    pub revoked: bool,
}

impl ModuleSlot {
    fn new(descriptor: ModuleDescriptor) -> Self {
        Self {
            descriptor,
            activation: None,
            resident: None,
            refcount: 0,
            idle_hits: 0,
            revoked: false,
        }
    }

    /// A module is loaded when its callbacks are installed: built-ins
    /// always, plugins only while their shared object is mapped.
    pub fn is_loaded(&self) -> bool {
        self.activation.is_some()
    }
}

/// Insertion-ordered table of every known module. The insertion index
/// doubles as the deterministic tie-break for equal scores.
#[derive(Default)]
pub(crate) struct ModuleRegistry {
    slots: Vec<ModuleSlot>,
}

impl ModuleRegistry {
    pub fn slot(&self, id: ModuleId) -> &ModuleSlot {
        &self.slots[id.0]
    }

    pub fn slot_mut(&mut self, id: ModuleId) -> &mut ModuleSlot {
        &mut self.slots[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModuleId, &ModuleSlot)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(idx, slot)| (ModuleId(idx), slot))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Register a built-in module (with submodules). Built-ins carry
    /// their callbacks from the start and are never unloaded.
    pub fn register_builtin(&mut self, registration: ModuleRegistration) -> ModuleId {
        self.register_registration(registration, true, None, None)
    }

    /// Register a freshly opened plugin's modules. `resident` keeps the
    /// shared object mapped when the plugin must stay loaded.
    pub fn register_plugin(
        &mut self,
        registration: ModuleRegistration,
        path: &Path,
        resident: Option<Arc<LoadedObject>>,
    ) -> ModuleId {
        self.register_registration(registration, false, Some(path.to_path_buf()), resident)
    }

    /// Register modules reconstituted from a cache entry. No callbacks
    /// are installed; the backing object is opened lazily on first use.
    pub fn register_cached(&mut self, modules: &[ModuleMetadata], path: &Path) {
        let mut parent: Option<ModuleId> = None;
        for metadata in modules {
            let descriptor = ModuleDescriptor {
                metadata: metadata.clone(),
                builtin: false,
                backing_file: Some(path.to_path_buf()),
                parent: if metadata.submodule { parent } else { None },
            };
            let id = self.push(ModuleSlot::new(descriptor));
            if !metadata.submodule {
                parent = Some(id);
            }
        }
    }

    /// Every non-revoked slot whose backing file is `path`.
    pub fn slots_for_file(&self, path: &Path) -> Vec<ModuleId> {
        self.iter()
            .filter(|(_, slot)| {
                !slot.revoked && slot.descriptor.backing_file.as_deref() == Some(path)
            })
            .map(|(id, _)| id)
            .collect()
    }

    fn register_registration(
        &mut self,
        registration: ModuleRegistration,
        builtin: bool,
        backing_file: Option<PathBuf>,
        resident: Option<Arc<LoadedObject>>,
    ) -> ModuleId {
        let ModuleRegistration {
            metadata,
            activation,
            submodules,
        } = registration;
        let keep_callbacks = builtin || resident.is_some();
        let mut slot = ModuleSlot::new(ModuleDescriptor {
            metadata,
            builtin,
            backing_file: backing_file.clone(),
            parent: None,
        });
        if keep_callbacks {
            slot.activation = Some(activation);
            slot.resident = resident.clone();
        }
        let parent = self.push(slot);
        self.register_submodules(submodules, parent, builtin, &backing_file, &resident, keep_callbacks);
        parent
    }

    fn register_submodules(
        &mut self,
        submodules: Vec<ModuleRegistration>,
        parent: ModuleId,
        builtin: bool,
        backing_file: &Option<PathBuf>,
        resident: &Option<Arc<LoadedObject>>,
        keep_callbacks: bool,
    ) {
        for sub in submodules {
            let ModuleRegistration {
                mut metadata,
                activation,
                submodules: nested,
            } = sub;
            metadata.submodule = true;
            if !nested.is_empty() {
                // one supported level; deeper nesting attaches to the same parent
                log::warn!(
                    "module \"{}\" nests submodules below one level, flattening",
                    metadata.short_name
                );
            }
            let mut slot = ModuleSlot::new(ModuleDescriptor {
                metadata,
                builtin,
                backing_file: backing_file.clone(),
                parent: Some(parent),
            });
            if keep_callbacks {
                slot.activation = Some(activation);
                slot.resident = resident.clone();
            }
            self.push(slot);
            self.register_submodules(nested, parent, builtin, backing_file, resident, keep_callbacks);
        }
    }

    fn push(&mut self, slot: ModuleSlot) -> ModuleId {
        let id = ModuleId(self.slots.len());
        self.slots.push(slot);
        id
    }
}
