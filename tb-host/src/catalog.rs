//! `plugins` command and plugin path resolution

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

use tb_core::HostConfig;
use tb_dynamic_loader::{platform_extension, PluginLoader, PluginRegistry};
use tb_plugins::PluginFamily;

pub fn run(config: &HostConfig, json: bool) -> Result<()> {
    info!(root = %config.plugins_root.display(), "Enumerating plugins");
    let registry = PluginRegistry::new(PluginLoader::new());
    let result = registry.enumerate(&config.plugins_root);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    for family in [PluginFamily::Image, PluginFamily::Height] {
        let catalog = result.catalog(family);
        println!("{} plugins ({}):", family, catalog.len());
        for record in catalog {
            let engines: Vec<String> = record
                .descriptor
                .supported_engines
                .iter()
                .map(|e| e.to_string())
                .collect();
            println!(
                "  {:<32} {:<28} [{}]",
                record.descriptor.description,
                record.filename,
                engines.join(", ")
            );
        }
    }

    if !result.diagnostics.is_empty() {
        println!("Failed to load ({}):", result.diagnostics.len());
        for diagnostic in &result.diagnostics {
            println!("  {}", diagnostic);
        }
    }
    Ok(())
}

/// Resolve a `--plugin` argument.
///
/// Paths are used as given. A bare name is looked up in the family folder,
/// with the platform module extension added when missing.
pub fn resolve_plugin(root: &Path, family: PluginFamily, plugin: &str) -> PathBuf {
    let given = Path::new(plugin);
    if given.components().count() > 1 || given.is_file() {
        return given.to_path_buf();
    }

    let mut path = PluginRegistry::family_dir(root, family).join(plugin);
    if path.extension().is_none() {
        path.set_extension(platform_extension());
    }
    path
}

/// Parse `a,b` into a pair of numbers
pub fn parse_pair(value: &str) -> Result<(f64, f64), String> {
    let (a, b) = value
        .split_once(',')
        .ok_or_else(|| format!("expected two comma-separated numbers, got '{}'", value))?;
    let parse = |s: &str| {
        s.trim()
            .parse::<f64>()
            .map_err(|e| format!("invalid number '{}': {}", s.trim(), e))
    };
    Ok((parse(a)?, parse(b)?))
}
