use std::path::PathBuf;
use thiserror::Error;

use tb_plugins::PluginFamily;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Plugin module not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to open module {path}: {message}")]
    Library { path: PathBuf, message: String },

    #[error("Module {path} does not export a {family} plugin")]
    MissingEntry { path: PathBuf, family: PluginFamily },

    #[error("Module {path} is a {found} plugin, not a {requested} plugin")]
    WrongFamily {
        path: PathBuf,
        requested: PluginFamily,
        found: PluginFamily,
    },

    #[error("Module {path} exports both image and height plugins")]
    AmbiguousEntry { path: PathBuf },

    #[error("Plugin constructor in {path} failed: {message}")]
    Construction { path: PathBuf, message: String },
}

pub type LoadResult<T> = std::result::Result<T, LoadError>;
