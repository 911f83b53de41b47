use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while opening a plugin shared object.
///
/// These are recovered per file during scanning (the file is marked
/// junk and the scan continues); they are never fatal to the process.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("plugin binary not found at {0}")]
    MissingBinary(PathBuf),
    #[error("failed to load plugin library: {0}")]
    Library(#[from] libloading::Error),
    #[error("no registration entry point in {0}")]
    MissingEntryPoint(PathBuf),
    #[error("plugin ABI mismatch in {path}: found {found}, expected {expected}")]
    AbiMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("registration entry point of {0} exported no modules")]
    NoModules(PathBuf),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-facing failures of [`crate::ModuleBank::need`].
#[derive(Debug, Error)]
pub enum NeedError {
    /// No registered module offers the requested capability, or no
    /// module matched the requested shortcut under strict mode.
    #[error("no {capability} module matched \"{name}\"")]
    NoSuchCapability { capability: String, name: String },
    /// Candidates existed but none could be activated.
    #[error("no {capability} module matching \"{name}\" could be activated")]
    ActivationFailed { capability: String, name: String },
}
