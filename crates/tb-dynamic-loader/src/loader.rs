//! Turns one module file into a typed plugin instance.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::{LoadError, LoadResult};
use crate::module_source::{DynamicLibrarySource, ModuleSource, OpenedModule};
use crate::registry::PluginRecord;
use tb_core::CapabilityDescriptor;
use tb_plugins::{HeightPlugin, HeightQuery, ImageAcquisition, ImagePlugin, ModuleRef, PluginFamily};

/// A freshly constructed image plugin bound to its module
pub struct ImagePluginHandle {
    // Dropped before `module`
    plugin: Box<dyn ImagePlugin>,
    module: ModuleRef,
    path: PathBuf,
    descriptor: CapabilityDescriptor,
}

impl ImagePluginHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    /// Catalog entry describing this module
    pub fn record(&self) -> PluginRecord {
        PluginRecord::new(PluginFamily::Image, &self.path, self.descriptor.clone())
    }

    pub fn plugin(&self) -> &dyn ImagePlugin {
        self.plugin.as_ref()
    }

    pub fn plugin_mut(&mut self) -> &mut dyn ImagePlugin {
        self.plugin.as_mut()
    }

    /// Hand the instance to the acquisition driver.
    pub fn into_acquisition(self) -> ImageAcquisition {
        ImageAcquisition::with_module(self.plugin, self.module)
    }
}

/// A freshly constructed height plugin bound to its module
pub struct HeightPluginHandle {
    plugin: Box<dyn HeightPlugin>,
    module: ModuleRef,
    path: PathBuf,
    descriptor: CapabilityDescriptor,
}

impl HeightPluginHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    pub fn record(&self) -> PluginRecord {
        PluginRecord::new(PluginFamily::Height, &self.path, self.descriptor.clone())
    }

    pub fn plugin(&self) -> &dyn HeightPlugin {
        self.plugin.as_ref()
    }

    pub fn plugin_mut(&mut self) -> &mut dyn HeightPlugin {
        self.plugin.as_mut()
    }

    pub fn into_query(self) -> HeightQuery {
        HeightQuery::with_module(self.plugin, self.module)
    }
}

/// Opens plugin modules and instantiates their single exported plugin
#[derive(Clone)]
pub struct PluginLoader {
    source: Arc<dyn ModuleSource>,
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginLoader {
    /// Loader for shared libraries on disk
    pub fn new() -> Self {
        Self::with_source(Arc::new(DynamicLibrarySource::new()))
    }

    pub fn with_source(source: Arc<dyn ModuleSource>) -> Self {
        Self { source }
    }

    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load_image(&self, path: impl AsRef<Path>) -> LoadResult<ImagePluginHandle> {
        let path = path.as_ref();
        let opened = self.open(path, PluginFamily::Image)?;
        let factory = opened.image.ok_or_else(|| LoadError::MissingEntry {
            path: path.to_path_buf(),
            family: PluginFamily::Image,
        })?;
        let plugin = construct(path, || factory())?;
        let descriptor = plugin.descriptor();
        debug!(description = %descriptor.description, "Loaded image plugin");

        Ok(ImagePluginHandle {
            plugin,
            module: opened.module,
            path: path.to_path_buf(),
            descriptor,
        })
    }

    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load_height(&self, path: impl AsRef<Path>) -> LoadResult<HeightPluginHandle> {
        let path = path.as_ref();
        let opened = self.open(path, PluginFamily::Height)?;
        let factory = opened.height.ok_or_else(|| LoadError::MissingEntry {
            path: path.to_path_buf(),
            family: PluginFamily::Height,
        })?;
        let plugin = construct(path, || factory())?;
        let descriptor = plugin.descriptor();
        debug!(description = %descriptor.description, "Loaded height plugin");

        Ok(HeightPluginHandle {
            plugin,
            module: opened.module,
            path: path.to_path_buf(),
            descriptor,
        })
    }

    /// Open the module and make sure it exports exactly the `family` entry.
    fn open(&self, path: &Path, family: PluginFamily) -> LoadResult<OpenedModule> {
        if !path.is_file() {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }

        let opened = self.source.open(path)?;
        match (opened.image.is_some(), opened.height.is_some()) {
            (true, true) => Err(LoadError::AmbiguousEntry {
                path: path.to_path_buf(),
            }),
            (false, false) => Err(LoadError::MissingEntry {
                path: path.to_path_buf(),
                family,
            }),
            (has_image, _) => {
                let found = if has_image {
                    PluginFamily::Image
                } else {
                    PluginFamily::Height
                };
                if found == family {
                    Ok(opened)
                } else {
                    Err(LoadError::WrongFamily {
                        path: path.to_path_buf(),
                        requested: family,
                        found,
                    })
                }
            }
        }
    }
}

fn construct<T>(path: &Path, factory: impl FnOnce() -> Option<T>) -> LoadResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(factory)) {
        Ok(Some(plugin)) => Ok(plugin),
        Ok(None) => Err(LoadError::Construction {
            path: path.to_path_buf(),
            message: "plugin constructor panicked".to_string(),
        }),
        Err(_) => Err(LoadError::Construction {
            path: path.to_path_buf(),
            message: "plugin factory panicked".to_string(),
        }),
    }
}
