//! tb-core: shared types for the terrain-builder plugin system
//!
//! Holds the value types that cross the host/plugin boundary:
//! - Capability metadata (`CapabilityDescriptor`, `GameEngine`)
//! - Image map requests (`ImageMapInformation`, `ImageType`)
//! - Height sampling inputs (`LatLong`, `InputMethod`, `HEIGHT_UNKNOWN`)
//! - Environment configuration for the host

pub mod config;
pub mod error;
pub mod types;

pub use config::HostConfig;
pub use error::{Error, Result};
pub use types::{
    is_unknown_height, CapabilityDescriptor, GameEngine, ImageMapInformation, ImageType,
    InputMethod, LatLong, HEIGHT_UNKNOWN,
};

/// Prelude for convenient imports
///
/// `Result` is left out so it never shadows `std::result::Result` in glob users.
pub mod prelude {
    pub use super::error::Error;
    pub use super::types::*;
}
