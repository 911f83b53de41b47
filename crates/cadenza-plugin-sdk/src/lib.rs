//! Cadenza Plugin SDK
//! ==================
//!
//! Types and macros shared between the Cadenza module bank and the plugin
//! shared objects it loads. A plugin crate implements [`ModuleActivation`]
//! for each capability it provides, describes itself with
//! [`ModuleMetadata`], and exports the whole bundle through
//! [`declare_cadenza_plugins!`], which emits the well-known C entry point
//! the bank resolves at load time.

mod context;
mod registry;

pub use context::ActivationContext;
pub use registry::{
    ActivationError, ConfigItem, ModuleActivation, ModuleMetadata, ModuleRegistration,
    PluginExport, MAX_SHORTCUTS,
};

/// ABI revision embedded in every [`PluginExport`]. The bank refuses to
/// adopt exports carrying any other value.
pub const PLUGIN_ABI_VERSION: u32 = 3;

/// Name of the registration entry point exported by plugin shared objects.
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"cadenza_module_entry\0";

/// Signature of the registration entry point. The returned pointer is a
/// `Box::into_raw` allocation owned by the caller.
pub type PluginEntryFn = unsafe extern "C" fn() -> *mut PluginExport;

/// Declare the registration entry point for a dynamic Cadenza plugin.
///
/// Each argument must evaluate to a [`ModuleRegistration`]. All of them are
/// collected into a single [`PluginExport`] returned to the module bank.
///
/// # Example
///
/// ```ignore
/// use cadenza_plugin_sdk::{declare_cadenza_plugins, ModuleMetadata, ModuleRegistration};
///
/// declare_cadenza_plugins!(ModuleRegistration::new(
///     ModuleMetadata::new("flac", "FLAC demuxer", "demux", 100),
///     std::sync::Arc::new(FlacDemux),
/// ));
/// ```
#[macro_export]
macro_rules! declare_cadenza_plugins {
    ($($module:expr),+ $(,)?) => {
        #[no_mangle]
        pub extern "C" fn cadenza_module_entry() -> *mut $crate::PluginExport {
            let mut export = $crate::PluginExport::new();
            $(export.register($module);)+
            Box::into_raw(Box::new(export))
        }
    };
}
