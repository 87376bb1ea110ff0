//! Error types for terrain-builder

use thiserror::Error;

/// Errors raised while validating host-side values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Unknown game engine: {0}")]
    UnknownEngine(String),

    #[error("Invalid image map: {0}")]
    InvalidImageMap(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_image_map(msg: impl Into<String>) -> Self {
        Error::InvalidImageMap(msg.into())
    }
}
