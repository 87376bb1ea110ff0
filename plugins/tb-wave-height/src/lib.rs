//! Sine-wave height plugin
//!
//! Heights follow `(sin(a * 0.01) + sin(b * 0.01)) * multiplier`, where `a`
//! and `b` are the Z and X offsets in meters. The multiplier is the only
//! per-project setting.
//!
//! The multiplier accepted for the last new project is remembered in an
//! application-wide defaults file, named by `TB_WAVE_DEFAULTS_FILE` or given
//! to [`WaveHeight::with_defaults_file`]. Projects without saved settings
//! start from it.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use tb_core::config::get_config_opt;
use tb_core::{GameEngine, InputMethod, LatLong};
use tb_plugins::{
    export_height_plugin, HeightPlugin, PersistenceError, Plugin, SettingsReader, SettingsWriter,
    ValidationResult,
};

/// Multiplier used until a project says otherwise
pub const DEFAULT_MULTIPLIER: f32 = 100.0;

/// Settings schema: `[multiplier: f32]`
pub const SETTINGS_VERSION: u32 = 1;

/// Defaults file schema: `[new project multiplier: f32]`
pub const DEFAULTS_VERSION: u32 = 1;

/// Variable naming the application-wide defaults file
pub const ENV_DEFAULTS_FILE: &str = "TB_WAVE_DEFAULTS_FILE";

const WAVE_FREQUENCY: f64 = 0.01;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Height multiplier must be a positive finite number, got {0}")]
pub struct InvalidMultiplier(pub f32);

fn check_multiplier(value: f32) -> Result<f32, InvalidMultiplier> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(InvalidMultiplier(value))
    }
}

pub struct WaveHeight {
    multiplier: f32,
    /// Value edited in the settings panel, applied on accept
    proposed: Option<f32>,
    /// Starting multiplier for new projects
    app_default: f32,
    defaults_file: Option<PathBuf>,
}

impl Default for WaveHeight {
    fn default() -> Self {
        match get_config_opt(ENV_DEFAULTS_FILE) {
            Some(path) => Self::with_defaults_file(path),
            None => Self::build(DEFAULT_MULTIPLIER, None),
        }
    }
}

impl WaveHeight {
    /// Remember new-project multipliers in `path`.
    ///
    /// A missing or unreadable file leaves [`DEFAULT_MULTIPLIER`] in place.
    pub fn with_defaults_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let app_default = match read_app_default(&path) {
            Ok(Some(value)) => value,
            Ok(None) => DEFAULT_MULTIPLIER,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable wave defaults");
                DEFAULT_MULTIPLIER
            }
        };
        Self::build(app_default, Some(path))
    }

    fn build(app_default: f32, defaults_file: Option<PathBuf>) -> Self {
        Self {
            multiplier: app_default,
            proposed: None,
            app_default,
            defaults_file,
        }
    }

    /// Multiplier a new project starts with
    pub fn app_default(&self) -> f32 {
        self.app_default
    }

    pub fn multiplier(&self) -> f32 {
        self.multiplier
    }

    pub fn set_multiplier(&mut self, value: f32) -> Result<(), InvalidMultiplier> {
        self.multiplier = check_multiplier(value)?;
        Ok(())
    }

    /// Stage a multiplier from the settings panel; validated and applied by
    /// the validate/accept hooks.
    pub fn propose_multiplier(&mut self, value: f32) {
        self.proposed = Some(value);
    }

    pub fn wave_height(&self, a: f64, b: f64) -> f64 {
        ((a * WAVE_FREQUENCY).sin() + (b * WAVE_FREQUENCY).sin()) * f64::from(self.multiplier)
    }

    fn validate_proposed(&self) -> ValidationResult {
        match self.proposed.map(check_multiplier) {
            Some(Err(e)) => ValidationResult::failure(e.to_string()),
            _ => ValidationResult::success(),
        }
    }

    fn apply_proposed(&mut self) {
        if let Some(value) = self.proposed.take() {
            if let Ok(value) = check_multiplier(value) {
                self.multiplier = value;
            }
        }
    }

    fn remember_app_default(&mut self) {
        self.app_default = self.multiplier;
        let Some(path) = &self.defaults_file else {
            return;
        };
        let result = SettingsWriter::create(path, DEFAULTS_VERSION).and_then(|mut writer| {
            writer.write_f32(self.multiplier)?;
            writer.finish()
        });
        match result {
            Ok(()) => info!(path = %path.display(), multiplier = self.multiplier, "Remembered new project multiplier"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to save wave defaults"),
        }
    }
}

fn read_app_default(path: &Path) -> Result<Option<f32>, PersistenceError> {
    let Some(mut reader) = SettingsReader::open(path, DEFAULTS_VERSION)? else {
        return Ok(None);
    };
    let value = reader.read_f32()?;
    check_multiplier(value)
        .map(Some)
        .map_err(|e| PersistenceError::InvalidValue(e.to_string()))
}

impl Plugin for WaveHeight {
    fn description(&self) -> &str {
        "Sine Wave Heights"
    }

    fn about(&self) -> &str {
        "Rolling semi-random heights from two sine waves."
    }

    fn supported_engines(&self) -> Vec<GameEngine> {
        vec![GameEngine::None, GameEngine::AssettoCorsa, GameEngine::RFactor]
    }

    fn validate_new_project_settings(&self) -> ValidationResult {
        self.validate_proposed()
    }

    fn validate_project_settings(&self) -> ValidationResult {
        self.validate_proposed()
    }

    fn accept_new_project_settings(&mut self) {
        self.apply_proposed();
        self.remember_app_default();
    }

    fn accept_project_settings(&mut self) {
        self.apply_proposed();
    }

    fn load(&mut self, path: &Path) -> Result<(), PersistenceError> {
        self.multiplier = self.app_default;
        let Some(mut reader) = SettingsReader::open(path, SETTINGS_VERSION)? else {
            debug!(path = %path.display(), "No saved wave settings");
            return Ok(());
        };
        let value = reader.read_f32()?;
        self.multiplier =
            check_multiplier(value).map_err(|e| PersistenceError::InvalidValue(e.to_string()))?;
        Ok(())
    }
}

impl HeightPlugin for WaveHeight {
    fn input_method(&self) -> InputMethod {
        InputMethod::MetersXZ
    }

    fn maximum_pair_count(&self) -> usize {
        1000
    }

    fn fetch(&self, latitude_or_z: f64, longitude_or_x: f64) -> f64 {
        self.wave_height(latitude_or_z, longitude_or_x)
    }

    fn fetch_batch(&self, pairs: &[LatLong]) -> Vec<f64> {
        pairs
            .iter()
            .map(|p| self.wave_height(p.latitude_or_z, p.longitude_or_x))
            .collect()
    }

    fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        let mut writer = SettingsWriter::create(path, SETTINGS_VERSION)?;
        writer.write_f32(self.multiplier)?;
        writer.finish()
    }
}

export_height_plugin!(WaveHeight);
