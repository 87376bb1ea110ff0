//! Value types shared by the host and plugins

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Height returned when a sample cannot be determined.
pub const HEIGHT_UNKNOWN: f64 = -10000.0;

/// True if `height` is the unknown-height sentinel.
pub fn is_unknown_height(height: f64) -> bool {
    height == HEIGHT_UNKNOWN
}

/// Target game engines a plugin may declare support for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameEngine {
    None,
    AssettoCorsa,
    RFactor,
    /// Wildcard: the plugin works for every engine
    All,
}

impl GameEngine {
    /// Numeric code used by project files
    pub fn code(self) -> i32 {
        match self {
            GameEngine::None => 0,
            GameEngine::AssettoCorsa => 1,
            GameEngine::RFactor => 2,
            GameEngine::All => 9999,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(GameEngine::None),
            1 => Some(GameEngine::AssettoCorsa),
            2 => Some(GameEngine::RFactor),
            9999 => Some(GameEngine::All),
            _ => None,
        }
    }
}

impl fmt::Display for GameEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameEngine::None => write!(f, "None"),
            GameEngine::AssettoCorsa => write!(f, "Assetto Corsa"),
            GameEngine::RFactor => write!(f, "rFactor"),
            GameEngine::All => write!(f, "All"),
        }
    }
}

/// Accepts the numeric code or a name (`assetto_corsa`, `rfactor`, ...),
/// ignoring case, spaces and separators.
impl FromStr for GameEngine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(code) = s.trim().parse::<i32>() {
            return GameEngine::from_code(code).ok_or_else(|| Error::UnknownEngine(s.to_string()));
        }

        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "none" => Ok(GameEngine::None),
            "assettocorsa" | "ac" => Ok(GameEngine::AssettoCorsa),
            "rfactor" => Ok(GameEngine::RFactor),
            "all" => Ok(GameEngine::All),
            _ => Err(Error::UnknownEngine(s.to_string())),
        }
    }
}

/// Coordinate system a height plugin expects its samples in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMethod {
    /// Geographic latitude/longitude in degrees
    LatitudeLongitude,
    /// Local planar X/Z offsets in meters
    MetersXZ,
}

/// Kind of image an image plugin produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    /// The colour texture visible on the terrain
    Main,
    /// Blend mask used to mix terrain textures
    Mask,
}

/// One coordinate pair for a height query.
///
/// Interpreted according to the plugin's [`InputMethod`]: latitude/longitude
/// or Z/X in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LatLong {
    pub latitude_or_z: f64,
    pub longitude_or_x: f64,
}

impl LatLong {
    pub fn new(latitude_or_z: f64, longitude_or_x: f64) -> Self {
        Self {
            latitude_or_z,
            longitude_or_x,
        }
    }
}

impl From<(f64, f64)> for LatLong {
    fn from((a, b): (f64, f64)) -> Self {
        Self::new(a, b)
    }
}

/// Capability metadata every plugin declares
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Short text shown in the host's plugin pickers
    pub description: String,
    /// Free-form information about the plugin's author
    pub about: String,
    /// Engines the plugin declares support for
    pub supported_engines: Vec<GameEngine>,
}

impl CapabilityDescriptor {
    pub fn new(
        description: impl Into<String>,
        about: impl Into<String>,
        engines: impl IntoIterator<Item = GameEngine>,
    ) -> Self {
        let mut supported_engines: Vec<GameEngine> = Vec::new();
        for engine in engines {
            if !supported_engines.contains(&engine) {
                supported_engines.push(engine);
            }
        }
        Self {
            description: description.into(),
            about: about.into(),
            supported_engines,
        }
    }

    /// Whether the plugin can target `engine`; `All` matches everything.
    pub fn supports(&self, engine: GameEngine) -> bool {
        self.supported_engines
            .iter()
            .any(|e| *e == engine || *e == GameEngine::All)
    }
}

/// Everything an image plugin needs to produce an image.
///
/// File names are relative to the xpacks folder handed to `create`/`resume`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageMapInformation {
    /// Destination of the main image
    pub filename: String,
    /// Occasionally refreshed in-progress view of the main image
    pub filename_intermediate: String,
    /// Destination of the mask image
    pub filename_mask: String,
    /// In-progress view of the mask image
    pub filename_intermediate_mask: String,
    /// Latitude at the centre of the image
    pub latitude: f64,
    /// Longitude at the centre of the image
    pub longitude: f64,
    /// Meters covered along X
    pub coverage_x: f64,
    /// Meters covered along Z
    pub coverage_z: f64,
    pub width: i32,
    pub height: i32,
    pub width_mask: i32,
    pub height_mask: i32,
}

impl ImageMapInformation {
    pub fn main_path(&self, xpacks: &Path) -> PathBuf {
        xpacks.join(&self.filename)
    }

    pub fn intermediate_path(&self, xpacks: &Path) -> PathBuf {
        xpacks.join(&self.filename_intermediate)
    }

    /// Check the request before it is handed to a plugin.
    pub fn validate(&self) -> Result<()> {
        if self.filename.trim().is_empty() {
            return Err(Error::invalid_image_map("main filename is empty"));
        }
        if self.width <= 0 || self.height <= 0 {
            return Err(Error::invalid_image_map(format!(
                "image size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.width_mask < 0 || self.height_mask < 0 {
            return Err(Error::invalid_image_map(format!(
                "mask size must not be negative, got {}x{}",
                self.width_mask, self.height_mask
            )));
        }
        for (axis, value) in [("x", self.coverage_x), ("z", self.coverage_z)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(Error::invalid_image_map(format!(
                    "coverage {} must be a finite non-negative distance, got {}",
                    axis, value
                )));
            }
        }
        Ok(())
    }

    /// True if coverage reaches at least the desired extents.
    pub fn covers(&self, desired_width: f64, desired_height: f64) -> bool {
        self.coverage_x >= desired_width && self.coverage_z >= desired_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_codes_round_trip() {
        for engine in [
            GameEngine::None,
            GameEngine::AssettoCorsa,
            GameEngine::RFactor,
            GameEngine::All,
        ] {
            assert_eq!(GameEngine::from_code(engine.code()), Some(engine));
        }
        assert_eq!(GameEngine::from_code(3), None);
    }

    #[test]
    fn test_descriptor_dedups_and_wildcard() {
        let d = CapabilityDescriptor::new(
            "Rainbow",
            "",
            [GameEngine::All, GameEngine::All],
        );
        assert_eq!(d.supported_engines, vec![GameEngine::All]);
        assert!(d.supports(GameEngine::RFactor));

        let d = CapabilityDescriptor::new("Waves", "", [GameEngine::AssettoCorsa]);
        assert!(d.supports(GameEngine::AssettoCorsa));
        assert!(!d.supports(GameEngine::RFactor));
    }

    #[test]
    fn test_map_paths_are_relative_to_xpacks() {
        let map = ImageMapInformation {
            filename: "venue/main.png".into(),
            filename_intermediate: "venue/main_tmp.png".into(),
            ..Default::default()
        };
        let xpacks = Path::new("/data/xpacks");
        assert_eq!(map.main_path(xpacks), PathBuf::from("/data/xpacks/venue/main.png"));
        assert_eq!(
            map.intermediate_path(xpacks),
            PathBuf::from("/data/xpacks/venue/main_tmp.png")
        );
    }

    #[test]
    fn test_engine_from_str() {
        assert_eq!("Assetto Corsa".parse::<GameEngine>(), Ok(GameEngine::AssettoCorsa));
        assert_eq!("rfactor".parse::<GameEngine>(), Ok(GameEngine::RFactor));
        assert_eq!("9999".parse::<GameEngine>(), Ok(GameEngine::All));
        assert_eq!(
            "iracing".parse::<GameEngine>(),
            Err(Error::UnknownEngine("iracing".to_string()))
        );
        assert!("3".parse::<GameEngine>().is_err());
    }

    #[test]
    fn test_map_validation() {
        let mut map = ImageMapInformation {
            filename: "venue/main.png".into(),
            width: 64,
            height: 64,
            coverage_x: 100.0,
            coverage_z: 100.0,
            ..Default::default()
        };
        assert!(map.validate().is_ok());

        map.height = 0;
        assert!(matches!(map.validate(), Err(Error::InvalidImageMap(_))));

        map.height = 64;
        map.coverage_z = f64::NAN;
        assert!(map.validate().is_err());

        map.coverage_z = 100.0;
        map.filename.clear();
        assert!(map.validate().is_err());
    }

    #[test]
    fn test_unknown_height_sentinel() {
        assert!(is_unknown_height(HEIGHT_UNKNOWN));
        assert!(!is_unknown_height(0.0));
    }
}
