//! Core plugin traits and entry points

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::lifecycle::{AcquisitionContext, AcquisitionFailure};
use crate::settings::PersistenceError;
use tb_core::{CapabilityDescriptor, GameEngine, ImageMapInformation, InputMethod, LatLong};

/// Symbol an image plugin module exports its factory under
pub const IMAGE_ENTRY_SYMBOL: &str = "tb_image_plugin_entry";

/// Symbol a height plugin module exports its factory under
pub const HEIGHT_ENTRY_SYMBOL: &str = "tb_height_plugin_entry";

/// Factory signature behind [`IMAGE_ENTRY_SYMBOL`].
///
/// Returns `None` when the plugin's constructor panicked.
#[allow(improper_ctypes_definitions)]
pub type ImagePluginEntryFn = unsafe extern "C" fn() -> Option<Box<dyn ImagePlugin>>;

/// Factory signature behind [`HEIGHT_ENTRY_SYMBOL`]
#[allow(improper_ctypes_definitions)]
pub type HeightPluginEntryFn = unsafe extern "C" fn() -> Option<Box<dyn HeightPlugin>>;

/// Keeps the module a plugin was loaded from resident.
///
/// Holders must drop the plugin instance before this reference.
pub type ModuleRef = Arc<dyn Any + Send + Sync>;

/// The two plugin families the host knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginFamily {
    Image,
    Height,
}

impl PluginFamily {
    /// Sub-folder of the plugins root holding this family's modules
    pub fn folder_name(self) -> &'static str {
        match self {
            PluginFamily::Image => "ImageMap",
            PluginFamily::Height => "Height",
        }
    }

    /// Sub-folder of a project's `Plugins/` folder holding settings blobs
    pub fn settings_folder_name(self) -> &'static str {
        match self {
            PluginFamily::Image => "Image",
            PluginFamily::Height => "Height",
        }
    }

    pub fn entry_symbol(self) -> &'static str {
        match self {
            PluginFamily::Image => IMAGE_ENTRY_SYMBOL,
            PluginFamily::Height => HEIGHT_ENTRY_SYMBOL,
        }
    }

    pub fn other(self) -> Self {
        match self {
            PluginFamily::Image => PluginFamily::Height,
            PluginFamily::Height => PluginFamily::Image,
        }
    }
}

impl fmt::Display for PluginFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginFamily::Image => write!(f, "image"),
            PluginFamily::Height => write!(f, "height"),
        }
    }
}

/// Outcome of a settings validation hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    /// Create a success result
    pub fn success() -> Self {
        Self {
            valid: true,
            errors: vec![],
        }
    }

    /// Create a failure result
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![error.into()],
        }
    }

    /// Add an error (makes result invalid)
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.valid = false;
        self.errors.push(message.into());
        self
    }

    /// All errors joined for display
    pub fn message(&self) -> String {
        self.errors.join("; ")
    }
}

/// Operations shared by every plugin family
pub trait Plugin: Send {
    /// Short text shown in the host's plugin pickers
    fn description(&self) -> &str;

    /// Information about the plugin's author
    fn about(&self) -> &str;

    /// Engines this plugin supports
    fn supported_engines(&self) -> Vec<GameEngine>;

    /// Capability metadata built from the accessors above
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(self.description(), self.about(), self.supported_engines())
    }

    /// Validate the settings chosen while configuring a new project
    fn validate_new_project_settings(&self) -> ValidationResult {
        ValidationResult::success()
    }

    /// Validate the settings chosen while editing an existing project
    fn validate_project_settings(&self) -> ValidationResult {
        ValidationResult::success()
    }

    /// The user accepted the new-project settings; perform one-off setup.
    fn accept_new_project_settings(&mut self) {}

    /// The user accepted edited project settings.
    fn accept_project_settings(&mut self) {}

    /// Legacy hook carrying the host's stored service API key.
    fn transfer_api_key(&mut self, _api_key: &str) {}

    /// Restore per-project state from `path`.
    ///
    /// A missing file is not an error. On `Err` the plugin must be left in
    /// its default state; the host logs the error and carries on.
    fn load(&mut self, path: &Path) -> Result<(), PersistenceError>;
}

/// Image map producers
pub trait ImagePlugin: Plugin {
    /// Whether the plugin also produces the terrain blend mask
    fn creates_mask(&self) -> bool {
        false
    }

    /// Use a white texture as the first mask texture
    fn use_white_mask_texture(&self) -> bool {
        true
    }

    fn uses_latitude_longitude(&self) -> bool {
        false
    }

    fn latitude(&self) -> f64 {
        0.0
    }

    fn longitude(&self) -> f64 {
        0.0
    }

    /// Whether partial progress can be saved and resumed in a later session
    fn supports_interruptions(&self) -> bool {
        false
    }

    /// True once `load` restored an unfinished acquisition
    fn has_pending_work(&self) -> bool {
        false
    }

    /// Set `map.coverage_x`/`coverage_z` to at least the desired extents.
    ///
    /// Called once, before the host allocates anything sized from `map`.
    fn set_coverage(&self, map: &mut ImageMapInformation, desired_width: f64, desired_height: f64);

    /// The user changed the requested venue size
    fn size_updated(&mut self, _width: i32, _height: i32) {}

    /// The user targeted a specific engine
    fn target_updated(&mut self, _target: GameEngine) {}

    /// Produce the image described by `map` under `xpacks`.
    ///
    /// Runs on a worker thread. Must poll `ctx.is_cancelled()` regularly and
    /// return promptly once it is set.
    fn create(
        &mut self,
        xpacks: &Path,
        map: &ImageMapInformation,
        ctx: &AcquisitionContext,
    ) -> Result<(), AcquisitionFailure>;

    /// Continue an acquisition restored by `load`.
    fn resume(&mut self, _xpacks: &Path, _ctx: &AcquisitionContext) -> Result<(), AcquisitionFailure> {
        Ok(())
    }

    /// Persist per-project state. `exiting` asks for enough state to resume later.
    fn save(&mut self, path: &Path, exiting: bool) -> Result<(), PersistenceError>;
}

/// Elevation providers
pub trait HeightPlugin: Plugin {
    /// Coordinate system of every sample handed to `fetch`
    fn input_method(&self) -> InputMethod;

    /// Milliseconds the host waits after a successful request
    fn timer_wait_success(&self) -> u64 {
        0
    }

    /// Milliseconds the host waits after a failed request
    fn timer_wait_failed(&self) -> u64 {
        0
    }

    /// Upper bound on pairs per `fetch_batch` call
    fn maximum_pair_count(&self) -> usize;

    /// Height at one coordinate pair, or `HEIGHT_UNKNOWN`
    fn fetch(&self, latitude_or_z: f64, longitude_or_x: f64) -> f64;

    /// Heights for `pairs`, same length and order
    fn fetch_batch(&self, pairs: &[LatLong]) -> Vec<f64> {
        pairs
            .iter()
            .map(|p| self.fetch(p.latitude_or_z, p.longitude_or_x))
            .collect()
    }

    /// Persist per-project state
    fn save(&self, path: &Path) -> Result<(), PersistenceError>;
}

/// Export an [`ImagePlugin`] type from a `cdylib` under [`IMAGE_ENTRY_SYMBOL`].
///
/// The type must implement `Default`. A panicking constructor is reported to
/// the loader instead of unwinding across the module boundary.
#[macro_export]
macro_rules! export_image_plugin {
    ($plugin:ty) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn tb_image_plugin_entry() -> Option<Box<dyn $crate::plugin::ImagePlugin>> {
            ::std::panic::catch_unwind(|| {
                Box::new(<$plugin as ::core::default::Default>::default())
                    as Box<dyn $crate::plugin::ImagePlugin>
            })
            .ok()
        }
    };
}

/// Export a [`HeightPlugin`] type from a `cdylib` under [`HEIGHT_ENTRY_SYMBOL`].
///
/// The type must implement `Default`.
#[macro_export]
macro_rules! export_height_plugin {
    ($plugin:ty) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn tb_height_plugin_entry() -> Option<Box<dyn $crate::plugin::HeightPlugin>> {
            ::std::panic::catch_unwind(|| {
                Box::new(<$plugin as ::core::default::Default>::default())
                    as Box<dyn $crate::plugin::HeightPlugin>
            })
            .ok()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlatHeights;

    impl Plugin for FlatHeights {
        fn description(&self) -> &str {
            "Flat"
        }
        fn about(&self) -> &str {
            "Everything at sea level"
        }
        fn supported_engines(&self) -> Vec<GameEngine> {
            vec![GameEngine::All, GameEngine::All]
        }
        fn load(&mut self, _path: &Path) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    impl HeightPlugin for FlatHeights {
        fn input_method(&self) -> InputMethod {
            InputMethod::MetersXZ
        }
        fn maximum_pair_count(&self) -> usize {
            10
        }
        fn fetch(&self, a: f64, b: f64) -> f64 {
            a + b
        }
        fn save(&self, _path: &Path) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    #[test]
    fn test_default_batch_matches_single_fetch() {
        let plugin = FlatHeights;
        let pairs = [LatLong::new(1.0, 2.0), LatLong::new(3.0, 4.0)];
        assert_eq!(plugin.fetch_batch(&pairs), vec![3.0, 7.0]);
    }

    #[test]
    fn test_descriptor_from_accessors() {
        let d = FlatHeights.descriptor();
        assert_eq!(d.description, "Flat");
        assert_eq!(d.supported_engines, vec![GameEngine::All]);
    }

    #[test]
    fn test_family_layout() {
        assert_eq!(PluginFamily::Image.folder_name(), "ImageMap");
        assert_eq!(PluginFamily::Height.settings_folder_name(), "Height");
        assert_eq!(PluginFamily::Image.other(), PluginFamily::Height);
        assert_eq!(PluginFamily::Height.entry_symbol(), HEIGHT_ENTRY_SYMBOL);
    }

    #[test]
    fn test_validation_result() {
        let r = ValidationResult::success().with_error("bad").with_error("worse");
        assert!(!r.valid);
        assert_eq!(r.message(), "bad; worse");
    }
}
