use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use libloading::Library;
use tracing::debug;

use crate::error::{LoadError, LoadResult};
use tb_plugins::{
    HeightPlugin, HeightPluginEntryFn, ImagePlugin, ImagePluginEntryFn, ModuleRef,
    HEIGHT_ENTRY_SYMBOL, IMAGE_ENTRY_SYMBOL,
};

/// Creates a fresh image plugin instance, `None` if construction failed
pub type ImageFactory = Arc<dyn Fn() -> Option<Box<dyn ImagePlugin>> + Send + Sync>;

/// Creates a fresh height plugin instance, `None` if construction failed
pub type HeightFactory = Arc<dyn Fn() -> Option<Box<dyn HeightPlugin>> + Send + Sync>;

/// An opened module and the entry points it exports
pub struct OpenedModule {
    pub image: Option<ImageFactory>,
    pub height: Option<HeightFactory>,
    /// Keeps the module resident while any instance it created is alive
    pub module: ModuleRef,
}

/// Where plugin modules come from
pub trait ModuleSource: Send + Sync {
    /// Open the module at `path`; the loader has already checked it exists.
    fn open(&self, path: &Path) -> LoadResult<OpenedModule>;
}

/// Opens shared libraries with libloading.
///
/// Libraries stay resident once opened; opening the same path again reuses
/// the mapping instead of calling into the dynamic linker.
#[derive(Debug, Default)]
pub struct DynamicLibrarySource {
    resident: Mutex<HashMap<PathBuf, Arc<Library>>>,
}

impl DynamicLibrarySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of libraries currently held resident
    pub fn resident_count(&self) -> usize {
        self.resident.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn library(&self, path: &Path) -> LoadResult<Arc<Library>> {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let mut resident = self.resident.lock().map_err(|_| LoadError::Library {
            path: path.to_path_buf(),
            message: "module table poisoned".to_string(),
        })?;
        if let Some(library) = resident.get(&key) {
            return Ok(Arc::clone(library));
        }

        // SAFETY: plugin modules run arbitrary initialisation code when
        // opened. Modules in the plugin folders are trusted by the host.
        let library = unsafe { Library::new(path) }.map_err(|e| LoadError::Library {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let library = Arc::new(library);
        resident.insert(key, Arc::clone(&library));
        Ok(library)
    }
}

impl ModuleSource for DynamicLibrarySource {
    fn open(&self, path: &Path) -> LoadResult<OpenedModule> {
        let library = self.library(path)?;

        // SAFETY: the symbol types are fixed by the export macros; the copied
        // fn pointers are only called while `library` is held by the factory.
        let image_entry: Option<ImagePluginEntryFn> = unsafe {
            library
                .get::<ImagePluginEntryFn>(IMAGE_ENTRY_SYMBOL.as_bytes())
                .ok()
                .map(|symbol| *symbol)
        };
        let height_entry: Option<HeightPluginEntryFn> = unsafe {
            library
                .get::<HeightPluginEntryFn>(HEIGHT_ENTRY_SYMBOL.as_bytes())
                .ok()
                .map(|symbol| *symbol)
        };
        debug!(
            path = %path.display(),
            image = image_entry.is_some(),
            height = height_entry.is_some(),
            "Opened plugin module"
        );

        let image = image_entry.map(|entry| {
            let library = Arc::clone(&library);
            Arc::new(move || {
                let _resident = &library;
                // SAFETY: see above
                unsafe { entry() }
            }) as ImageFactory
        });
        let height = height_entry.map(|entry| {
            let library = Arc::clone(&library);
            Arc::new(move || {
                let _resident = &library;
                // SAFETY: see above
                unsafe { entry() }
            }) as HeightFactory
        });

        Ok(OpenedModule {
            image,
            height,
            module: library,
        })
    }
}

#[derive(Clone)]
struct StaticModule {
    image: Option<fn() -> Box<dyn ImagePlugin>>,
    height: Option<fn() -> Box<dyn HeightPlugin>>,
}

/// Plugins compiled into the host, registered under a module file name.
///
/// Opening a path looks up its file name, so a folder of placeholder files
/// enumerates exactly like a folder of real modules.
#[derive(Clone, Default)]
pub struct StaticModuleSource {
    modules: HashMap<String, StaticModule>,
}

impl StaticModuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, file_name: impl Into<String>, factory: fn() -> Box<dyn ImagePlugin>) -> Self {
        self.entry(file_name.into()).image = Some(factory);
        self
    }

    pub fn with_height(mut self, file_name: impl Into<String>, factory: fn() -> Box<dyn HeightPlugin>) -> Self {
        self.entry(file_name.into()).height = Some(factory);
        self
    }

    fn entry(&mut self, file_name: String) -> &mut StaticModule {
        self.modules.entry(file_name).or_insert(StaticModule {
            image: None,
            height: None,
        })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl ModuleSource for StaticModuleSource {
    fn open(&self, path: &Path) -> LoadResult<OpenedModule> {
        let module = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| self.modules.get(n))
            .ok_or_else(|| LoadError::Library {
                path: path.to_path_buf(),
                message: "no compiled-in module registered under this name".to_string(),
            })?;

        Ok(OpenedModule {
            image: module
                .image
                .map(|f| Arc::new(move || Some(f())) as ImageFactory),
            height: module
                .height
                .map(|f| Arc::new(move || Some(f())) as HeightFactory),
            module: Arc::new(()),
        })
    }
}
