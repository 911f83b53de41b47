//! Cadenza module bank
//! ===================
//!
//! The plugin resolution engine at the center of the Cadenza media
//! framework. Every pluggable capability (demuxer, decoder, filter,
//! access method, output sink) is discovered on disk, described,
//! scored, loaded on demand, reference-counted, and eventually
//! unloaded through this crate.
//!
//! The [`ModuleBank`] is the single public entry point: construct one
//! per process, populate it with [`ModuleBank::load_builtins`] and
//! [`ModuleBank::load_plugins`], then acquire implementations with
//! [`ModuleBank::need`] and release them with [`ModuleBank::unneed`].
//! Scanning reconciles the on-disk plugin set against the persisted
//! cache from [`cadenza_plugin_db`] so unchanged shared objects are
//! never re-opened across runs.

mod bank;
mod cpu;
mod descriptor;
mod error;
mod loader;
mod resolver;
mod scanner;

pub use bank::{BankConfig, ModuleBank, ModuleHandle, IDLE_UNLOAD_THRESHOLD};
pub use cpu::CpuFeatures;
pub use descriptor::{ModuleDescriptor, ModuleId};
pub use error::{LoadError, NeedError};
pub use loader::{DynamicLoader, LoadedObject, LoadedPlugin, PluginLibrary, PluginLoader};
pub use scanner::{ScanConfig, ScanResult, ScanStats, ScannedPlugin, ScannedSource};

pub use cadenza_plugin_db::{CacheEntry, CacheStore, StoreError, CACHE_VERSION};
pub use cadenza_plugin_sdk::{
    ActivationContext, ActivationError, ConfigItem, ModuleActivation, ModuleMetadata,
    ModuleRegistration, PluginExport,
};
