//! tb-dynamic-loader: finds plugin modules and turns them into typed handles
//!
//! - `PluginLoader` opens one module, checks it exports exactly one plugin
//!   family, and constructs the instance
//! - `PluginRegistry` scans the `ImageMap/` and `Height/` folders and builds
//!   description-ordered catalogs plus per-module diagnostics
//! - `ModuleSource` abstracts where modules come from: shared libraries on
//!   disk, or factories compiled into the host

pub mod error;
pub mod loader;
pub mod module_source;
pub mod registry;

pub use error::{LoadError, LoadResult};
pub use loader::{HeightPluginHandle, ImagePluginHandle, PluginLoader};
pub use module_source::{
    DynamicLibrarySource, HeightFactory, ImageFactory, ModuleSource, OpenedModule,
    StaticModuleSource,
};
pub use registry::{
    platform_extension, settings_path, Enumeration, LoadDiagnostic, PluginCatalog, PluginRecord,
    PluginRegistry,
};
