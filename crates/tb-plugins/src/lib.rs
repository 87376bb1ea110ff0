//! tb-plugins: the contracts between the terrain-builder host and its plugins
//!
//! Features:
//! - `Plugin`, `ImagePlugin` and `HeightPlugin` capability traits
//! - Entry symbols and export macros for dynamically loaded plugin modules
//! - Versioned binary settings codec for per-project plugin state
//! - Cancellable image acquisition lifecycle (create / resume / stop)
//! - Batched, throttled height query driver

pub mod height;
pub mod lifecycle;
pub mod plugin;
pub mod settings;

pub use height::{coordinates_for, HeightQuery};
pub use lifecycle::{
    AcquisitionContext, AcquisitionFailure, AcquisitionHandle, AcquisitionOutcome,
    AcquisitionState, CancelToken, CompletedCallback, ImageAcquisition, LifecycleError,
    ProgressCallback,
};
pub use plugin::{
    HeightPlugin, HeightPluginEntryFn, ImagePlugin, ImagePluginEntryFn, ModuleRef, Plugin,
    PluginFamily, ValidationResult, HEIGHT_ENTRY_SYMBOL, IMAGE_ENTRY_SYMBOL,
};
pub use settings::{PersistenceError, SettingsReader, SettingsWriter};

/// Prelude for plugin authors
pub mod prelude {
    pub use super::lifecycle::{AcquisitionContext, AcquisitionFailure};
    pub use super::plugin::{HeightPlugin, ImagePlugin, Plugin, ValidationResult};
    pub use super::settings::{load_or_default, PersistenceError, SettingsReader, SettingsWriter};
    pub use super::{export_height_plugin, export_image_plugin};
    pub use tb_core::prelude::*;
}
