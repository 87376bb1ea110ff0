//! Host configuration from the environment
//!
//! Before reading any `TB_*` variable the host calls [`load_environment`],
//! which imports `KEY=VALUE` lines from the first environment file found:
//!
//! 1. the file named by `TB_ENV_FILE`
//! 2. `/etc/terrain-builder/environment`
//! 3. `/etc/terrain-builder.env`
//! 4. `.env` in the working directory
//!
//! Variables already present in the process environment always win.
//!
//! ```rust
//! use tb_core::config::{load_environment, HostConfig};
//!
//! load_environment();
//! let config = HostConfig::from_env();
//! println!("plugins live in {}", config.plugins_root.display());
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Variable that points at an explicit environment file
pub const ENV_FILE_VAR: &str = "TB_ENV_FILE";

/// Environment files tried in order when `TB_ENV_FILE` is unset or unreadable
pub const ENV_FILE_PATHS: &[&str] = &[
    "/etc/terrain-builder/environment",
    "/etc/terrain-builder.env",
    ".env",
];

/// Variable naming the plugins root folder
pub const ENV_PLUGINS_ROOT: &str = "TB_PLUGINS_ROOT";
/// Variable naming the active project folder
pub const ENV_PROJECT_DIR: &str = "TB_PROJECT_DIR";
/// Variable naming the xpacks output folder
pub const ENV_XPACKS_DIR: &str = "TB_XPACKS_DIR";
/// Variable switching host logs to JSON lines
pub const ENV_LOG_JSON: &str = "TB_LOG_JSON";

/// Import the first environment file found.
///
/// Returns the file that was applied, if any.
pub fn load_environment() -> Option<PathBuf> {
    let explicit = std::env::var(ENV_FILE_VAR).ok().map(PathBuf::from);
    let candidates = explicit
        .into_iter()
        .chain(ENV_FILE_PATHS.iter().map(PathBuf::from));

    for path in candidates {
        if apply_env_file(&path).is_some() {
            return Some(path);
        }
    }

    debug!("No environment file found, using existing environment");
    None
}

/// Apply one environment file. `None` if it does not exist or cannot be read,
/// otherwise the number of variables that were set.
fn apply_env_file(path: &Path) -> Option<usize> {
    if !path.is_file() {
        return None;
    }

    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read environment file");
            return None;
        }
    };

    let mut applied = 0;
    for (key, value) in content.lines().filter_map(parse_env_line) {
        if std::env::var_os(&key).is_some() {
            debug!(%key, "Keeping value already in the environment");
            continue;
        }
        std::env::set_var(&key, &value);
        applied += 1;
    }

    info!(path = %path.display(), applied, "Loaded environment file");
    Some(applied)
}

/// `KEY=VALUE`, optionally quoted; blank lines and `#` comments yield `None`.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let value = value.trim();
    let value = ['"', '\'']
        .iter()
        .find_map(|q| value.strip_prefix(*q).and_then(|v| v.strip_suffix(*q)))
        .unwrap_or(value);

    Some((key.to_string(), value.to_string()))
}

/// Non-empty value of `key`
pub fn get_config_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// `true`/`1`/`yes`/`on` (any case) are true; anything else set is false.
pub fn get_config_bool(key: &str, default: bool) -> bool {
    get_config_opt(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(default)
}

/// Folder layout the host works against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Root holding the `ImageMap/` and `Height/` plugin folders
    pub plugins_root: PathBuf,
    /// Active project folder; per-plugin settings live under `Plugins/` inside it
    pub project_dir: PathBuf,
    /// Folder image plugins write their artifacts into
    pub xpacks_dir: PathBuf,
    pub log_json: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            plugins_root: PathBuf::from("Plugins"),
            project_dir: PathBuf::from("."),
            xpacks_dir: PathBuf::from("xpacks"),
            log_json: false,
        }
    }
}

impl HostConfig {
    /// Build the configuration from `TB_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let path = |key: &str, fallback: PathBuf| get_config_opt(key).map(PathBuf::from).unwrap_or(fallback);
        Self {
            plugins_root: path(ENV_PLUGINS_ROOT, defaults.plugins_root),
            project_dir: path(ENV_PROJECT_DIR, defaults.project_dir),
            xpacks_dir: path(ENV_XPACKS_DIR, defaults.xpacks_dir),
            log_json: get_config_bool(ENV_LOG_JSON, defaults.log_json),
        }
    }
}
