//! Plugin folder enumeration
//!
//! ```text
//! <plugins root>/
//!   ImageMap/   image plugin modules
//!   Height/     height plugin modules
//! ```
//!
//! Every enumeration rebuilds both catalogs from scratch. A module that
//! fails to load is left out of its catalog and reported as a diagnostic;
//! it never aborts the scan.

use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use crate::loader::PluginLoader;
use tb_core::CapabilityDescriptor;
use tb_plugins::PluginFamily;

/// Extension of loadable modules on this platform (`so`, `dylib` or `dll`)
pub fn platform_extension() -> &'static str {
    std::env::consts::DLL_EXTENSION
}

/// One successfully loaded plugin module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginRecord {
    pub family: PluginFamily,
    /// Module file name, the identity the host persists for the active plugin
    pub filename: String,
    pub path: PathBuf,
    pub descriptor: CapabilityDescriptor,
}

impl PluginRecord {
    pub fn new(family: PluginFamily, path: &Path, descriptor: CapabilityDescriptor) -> Self {
        Self {
            family,
            filename: file_name_of(path),
            path: path.to_path_buf(),
            descriptor,
        }
    }
}

/// Loaded plugins of one family, ordered by description
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginCatalog {
    family: PluginFamily,
    records: Vec<PluginRecord>,
}

impl PluginCatalog {
    fn new(family: PluginFamily) -> Self {
        Self {
            family,
            records: Vec::new(),
        }
    }

    pub fn family(&self) -> PluginFamily {
        self.family
    }

    pub fn records(&self) -> &[PluginRecord] {
        &self.records
    }

    pub fn find(&self, filename: &str) -> Option<&PluginRecord> {
        self.records.iter().find(|r| r.filename == filename)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PluginRecord> {
        self.records.iter()
    }
}

impl<'a> IntoIterator for &'a PluginCatalog {
    type Item = &'a PluginRecord;
    type IntoIter = std::slice::Iter<'a, PluginRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// A module or folder that could not be enumerated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadDiagnostic {
    pub family: PluginFamily,
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for LoadDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.family, self.path.display(), self.message)
    }
}

/// Result of one enumeration pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enumeration {
    pub images: PluginCatalog,
    pub heights: PluginCatalog,
    pub diagnostics: Vec<LoadDiagnostic>,
}

impl Enumeration {
    pub fn catalog(&self, family: PluginFamily) -> &PluginCatalog {
        match family {
            PluginFamily::Image => &self.images,
            PluginFamily::Height => &self.heights,
        }
    }
}

/// Scans a plugins root and builds the per-family catalogs
pub struct PluginRegistry {
    loader: PluginLoader,
    extension: String,
}

impl PluginRegistry {
    pub fn new(loader: PluginLoader) -> Self {
        Self {
            loader,
            extension: platform_extension().to_string(),
        }
    }

    /// Override the module extension (without the dot)
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Location of a family's modules under `root`
    pub fn family_dir(root: &Path, family: PluginFamily) -> PathBuf {
        root.join(family.folder_name())
    }

    #[instrument(skip(self), fields(root = %root.display()))]
    pub fn enumerate(&self, root: &Path) -> Enumeration {
        let mut diagnostics = Vec::new();
        let images = self.scan(root, PluginFamily::Image, &mut diagnostics);
        let heights = self.scan(root, PluginFamily::Height, &mut diagnostics);

        info!(
            images = images.len(),
            heights = heights.len(),
            diagnostics = diagnostics.len(),
            "Plugin enumeration complete"
        );

        Enumeration {
            images,
            heights,
            diagnostics,
        }
    }

    fn scan(
        &self,
        root: &Path,
        family: PluginFamily,
        diagnostics: &mut Vec<LoadDiagnostic>,
    ) -> PluginCatalog {
        let mut catalog = PluginCatalog::new(family);
        let dir = Self::family_dir(root, family);

        if !dir.is_dir() {
            debug!(dir = %dir.display(), "Plugin folder missing; empty catalog");
            return catalog;
        }

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot read plugin folder");
                diagnostics.push(LoadDiagnostic {
                    family,
                    path: dir,
                    message: e.to_string(),
                });
                return catalog;
            }
        };

        let mut candidates: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.matches_extension(path))
            .collect();
        candidates.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        for path in candidates {
            let loaded = match family {
                PluginFamily::Image => self
                    .loader
                    .load_image(&path)
                    .map(|handle| handle.descriptor().clone()),
                PluginFamily::Height => self
                    .loader
                    .load_height(&path)
                    .map(|handle| handle.descriptor().clone()),
            };

            match loaded {
                Ok(descriptor) => {
                    debug!(path = %path.display(), description = %descriptor.description, "Catalogued plugin");
                    catalog
                        .records
                        .push(PluginRecord::new(family, &path, descriptor));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping plugin module");
                    diagnostics.push(LoadDiagnostic {
                        family,
                        path,
                        message: e.to_string(),
                    });
                }
            }
        }

        // stable: equal descriptions keep file name order
        catalog
            .records
            .sort_by(|a, b| a.descriptor.description.as_bytes().cmp(b.descriptor.description.as_bytes()));
        catalog
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false)
    }
}

/// Settings blob for `record` inside a project:
/// `<project>/Plugins/<Image|Height>/<module stem>.bin`
pub fn settings_path(project_dir: &Path, family: PluginFamily, record: &PluginRecord) -> PathBuf {
    let stem = record
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| record.filename.clone());
    project_dir
        .join("Plugins")
        .join(family.settings_folder_name())
        .join(format!("{}.bin", stem))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tb_core::GameEngine;

    fn record(path: &str) -> PluginRecord {
        PluginRecord::new(
            PluginFamily::Image,
            Path::new(path),
            CapabilityDescriptor::new("Rainbow", "", [GameEngine::All]),
        )
    }

    #[test]
    fn test_settings_path_layout() {
        let path = settings_path(
            Path::new("/projects/spa"),
            PluginFamily::Image,
            &record("/plugins/ImageMap/libtb_rainbow_image.so"),
        );
        assert_eq!(
            path,
            PathBuf::from("/projects/spa/Plugins/Image/libtb_rainbow_image.bin")
        );
    }

    #[test]
    fn test_extension_override_strips_dot() {
        let registry = PluginRegistry::new(PluginLoader::new()).with_extension(".DLL");
        assert_eq!(registry.extension(), "DLL");
        assert!(registry.matches_extension(Path::new("a/wave.dll")));
        assert!(!registry.matches_extension(Path::new("a/wave.so")));
        assert!(!registry.matches_extension(Path::new("a/wave")));
    }

    #[test]
    fn test_missing_root_is_empty_without_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::new(PluginLoader::new());
        let result = registry.enumerate(&dir.path().join("nowhere"));
        assert!(result.images.is_empty());
        assert!(result.heights.is_empty());
        assert!(result.diagnostics.is_empty());
    }
}
