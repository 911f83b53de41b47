use std::fmt;
use std::path::{Path, PathBuf};

use libloading::Library;

use cadenza_plugin_sdk::{
    ModuleRegistration, PluginEntryFn, PluginExport, PLUGIN_ABI_VERSION, PLUGIN_ENTRY_SYMBOL,
};

use crate::error::LoadError;

/// Exclusive owner of a mapped plugin shared object.
///
/// Dropping this unloads the library, so it must never be dropped while
/// activation callbacks resolved from it can still run. The bank keeps
/// it inside registry slots and only releases it from a verified
/// zero-reference state.
pub struct PluginLibrary {
    path: PathBuf,
    _library: Library,
}

impl PluginLibrary {
    /// Open a plugin shared object, resolve the registration entry
    /// point, validate the embedded ABI tag, and collect the exported
    /// module registrations.
    pub fn open(path: &Path) -> Result<(Self, Vec<ModuleRegistration>), LoadError> {
        if !path.exists() {
            return Err(LoadError::MissingBinary(path.to_path_buf()));
        }

        let library = unsafe { Library::new(path) }?;
        let entry = unsafe {
            library
                .get::<PluginEntryFn>(PLUGIN_ENTRY_SYMBOL)
                .map_err(|_| LoadError::MissingEntryPoint(path.to_path_buf()))?
        };
        let raw = unsafe { entry() };
        if raw.is_null() {
            return Err(LoadError::NoModules(path.to_path_buf()));
        }
        // Ownership transfers from the plugin's entry point to us.
        let export: Box<PluginExport> = unsafe { Box::from_raw(raw) };
        if export.abi_version() != PLUGIN_ABI_VERSION {
            return Err(LoadError::AbiMismatch {
                path: path.to_path_buf(),
                found: export.abi_version(),
                expected: PLUGIN_ABI_VERSION,
            });
        }
        let modules = export.into_modules();
        if modules.is_empty() {
            return Err(LoadError::NoModules(path.to_path_buf()));
        }

        Ok((
            Self {
                path: path.to_path_buf(),
                _library: library,
            },
            modules,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for PluginLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginLibrary")
            .field("path", &self.path)
            .finish()
    }
}

/// Backing object kept resident for a loaded plugin file. The inner
/// library is `None` for loaders that do not map real shared objects.
#[derive(Debug)]
pub struct LoadedObject {
    path: PathBuf,
    _library: Option<PluginLibrary>,
}

impl LoadedObject {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Result of opening one plugin file.
pub struct LoadedPlugin {
    pub registrations: Vec<ModuleRegistration>,
    pub object: LoadedObject,
}

/// Seam between the bank and the platform's dynamic linker.
///
/// Production uses [`DynamicLoader`]; tests inject fakes to observe
/// exactly when files are opened (the cache fast path must never reach
/// this trait for an unchanged file).
pub trait PluginLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedPlugin, LoadError>;
}

/// Loader backed by the platform dynamic linker via `libloading`.
#[derive(Debug, Default)]
pub struct DynamicLoader;

impl PluginLoader for DynamicLoader {
    fn load(&self, path: &Path) -> Result<LoadedPlugin, LoadError> {
        let (library, registrations) = PluginLibrary::open(path)?;
        Ok(LoadedPlugin {
            registrations,
            object: LoadedObject {
                path: path.to_path_buf(),
                _library: Some(library),
            },
        })
    }
}

#[cfg(test)]
pub(crate) fn fake_loaded(path: &Path, registrations: Vec<ModuleRegistration>) -> LoadedPlugin {
    LoadedPlugin {
        registrations,
        object: LoadedObject {
            path: path.to_path_buf(),
            _library: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_missing_binary_fails_cleanly() {
        let err = PluginLibrary::open(Path::new("/nonexistent/libnothing.so")).unwrap_err();
        assert!(matches!(err, LoadError::MissingBinary(_)));
    }

    #[test]
    fn open_non_library_file_reports_library_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-plugin.so");
        std::fs::write(&path, b"definitely not elf").unwrap();
        let err = PluginLibrary::open(&path).unwrap_err();
        assert!(matches!(err, LoadError::Library(_)));
    }
}
