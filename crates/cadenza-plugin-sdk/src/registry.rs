use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ActivationContext;

/// Upper bound on the number of shortcuts a single module may declare.
pub const MAX_SHORTCUTS: usize = 50;

/// Error returned by a failed [`ModuleActivation::activate`] call.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("module activation failed: {0}")]
    Failed(String),
    #[error("module does not support the requested configuration")]
    Unsupported,
}

impl ActivationError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Capability interface every loadable module implements.
///
/// `activate` is invoked when the bank selects the module for a caller and
/// `deactivate` when the caller releases it. Both run outside the bank
/// lock and may themselves acquire further modules through the bank.
pub trait ModuleActivation: Send + Sync {
    fn activate(&self, ctx: &ActivationContext) -> Result<(), ActivationError>;

    fn deactivate(&self, _ctx: &ActivationContext) {}
}

/// Opaque configuration record attached to a module. The bank persists
/// these through the plugin cache but never interprets them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigItem {
    pub name: String,
    pub value: Option<String>,
}

impl ConfigItem {
    pub fn new(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Static description of one loadable module, as declared by its plugin
/// and as persisted in the plugin cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleMetadata {
    pub short_name: String,
    pub long_name: String,
    /// Case-insensitive selector keys, capped at [`MAX_SHORTCUTS`]. The
    /// short name always matches as an implicit first shortcut.
    pub shortcuts: Vec<String>,
    pub capability: String,
    pub score: i32,
    /// CPU feature bits that must all be present for this module to be
    /// eligible. Interpreted by the bank's CPU probe.
    pub required_cpu: u32,
    pub unloadable: bool,
    pub reentrant: bool,
    pub submodule: bool,
    pub config_items: Vec<ConfigItem>,
}

impl ModuleMetadata {
    pub fn new(
        short_name: impl Into<String>,
        long_name: impl Into<String>,
        capability: impl Into<String>,
        score: i32,
    ) -> Self {
        Self {
            short_name: short_name.into(),
            long_name: long_name.into(),
            shortcuts: Vec::new(),
            capability: capability.into(),
            score,
            required_cpu: 0,
            unloadable: true,
            reentrant: false,
            submodule: false,
            config_items: Vec::new(),
        }
    }

    pub fn with_shortcuts<I, S>(mut self, shortcuts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shortcuts = shortcuts
            .into_iter()
            .take(MAX_SHORTCUTS)
            .map(Into::into)
            .collect();
        self
    }

    pub fn with_required_cpu(mut self, bits: u32) -> Self {
        self.required_cpu = bits;
        self
    }

    pub fn with_config_items(mut self, items: Vec<ConfigItem>) -> Self {
        self.config_items = items;
        self
    }

    /// Pin the module in memory once loaded.
    pub fn pinned(mut self) -> Self {
        self.unloadable = false;
        self
    }

    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    /// Case-insensitive shortcut lookup, including the short name itself.
    pub fn matches_shortcut(&self, wanted: &str) -> bool {
        self.short_name.eq_ignore_ascii_case(wanted)
            || self
                .shortcuts
                .iter()
                .any(|s| s.eq_ignore_ascii_case(wanted))
    }
}

/// One module declared by a plugin: its metadata, its activation
/// callbacks, and at most one level of submodules sharing the same
/// backing shared object.
pub struct ModuleRegistration {
    pub metadata: ModuleMetadata,
    pub activation: Arc<dyn ModuleActivation>,
    pub submodules: Vec<ModuleRegistration>,
}

impl ModuleRegistration {
    pub fn new(metadata: ModuleMetadata, activation: Arc<dyn ModuleActivation>) -> Self {
        Self {
            metadata,
            activation,
            submodules: Vec::new(),
        }
    }

    /// Attach a submodule. Submodules of submodules are not supported;
    /// nesting below one level is flattened away by the bank.
    pub fn with_submodule(mut self, mut submodule: ModuleRegistration) -> Self {
        submodule.metadata.submodule = true;
        self.submodules.push(submodule);
        self
    }

    /// The registration plus its submodules, parent first.
    pub fn flattened(&self) -> impl Iterator<Item = &ModuleRegistration> {
        std::iter::once(self).chain(self.submodules.iter())
    }
}

impl std::fmt::Debug for ModuleRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistration")
            .field("metadata", &self.metadata)
            .field("submodules", &self.submodules.len())
            .finish()
    }
}

/// The bundle a plugin's registration entry point hands to the bank.
pub struct PluginExport {
    abi_version: u32,
    modules: Vec<ModuleRegistration>,
}

impl PluginExport {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            abi_version: crate::PLUGIN_ABI_VERSION,
            modules: Vec::new(),
        }
    }

    pub fn register(&mut self, module: ModuleRegistration) -> &mut Self {
        self.modules.push(module);
        self
    }

    pub fn abi_version(&self) -> u32 {
        self.abi_version
    }

    pub fn modules(&self) -> &[ModuleRegistration] {
        &self.modules
    }

    pub fn into_modules(self) -> Vec<ModuleRegistration> {
        self.modules
    }
}
