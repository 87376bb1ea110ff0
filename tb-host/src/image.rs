//! `image` command: run or resume an image acquisition

use anyhow::{bail, Context, Result};
use clap::Args;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use tb_core::{GameEngine, HostConfig, ImageMapInformation, ImageType};
use tb_dynamic_loader::{settings_path, PluginLoader};
use tb_plugins::{AcquisitionOutcome, CompletedCallback, PluginFamily, ProgressCallback};

use crate::catalog::{parse_pair, resolve_plugin};

#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Module file name in the ImageMap/ folder, or a path to it
    #[arg(long)]
    plugin: String,

    /// Area to cover as width,height in meters
    #[arg(long, value_parser = parse_pair, required_unless_present = "resume")]
    size: Option<(f64, f64)>,

    /// Image width in pixels
    #[arg(long, default_value_t = 1024)]
    width: i32,

    /// Image height in pixels
    #[arg(long, default_value_t = 1024)]
    height: i32,

    /// Venue centre as lat,lon
    #[arg(long, value_parser = parse_pair, allow_hyphen_values = true, default_value = "0,0")]
    origin: (f64, f64),

    /// Engine the image is produced for (e.g. assetto_corsa, rfactor)
    #[arg(long)]
    target: Option<GameEngine>,

    /// Continue the acquisition interrupted in a previous session
    #[arg(long)]
    resume: bool,
}

pub async fn run(config: &HostConfig, args: ImageArgs) -> Result<()> {
    let path = resolve_plugin(&config.plugins_root, PluginFamily::Image, &args.plugin);
    let handle = PluginLoader::new()
        .load_image(&path)
        .with_context(|| format!("Failed to load image plugin {}", path.display()))?;
    let settings = settings_path(&config.project_dir, PluginFamily::Image, &handle.record());

    let mut acq = handle.into_acquisition();
    acq.load(&settings).await?;

    if let Some(target) = args.target {
        if !acq.descriptor().supports(target) {
            warn!(plugin = %acq.descriptor().description, %target, "Plugin does not declare support for target engine");
        }
        acq.target_updated(target).await?;
    }

    let progress = progress_logger();
    let on_completed: CompletedCallback = Box::new(|outcome: &AcquisitionOutcome| {
        if outcome.success() {
            info!(duration_ms = outcome.duration_ms, "Image finished");
        }
    });

    let running = if args.resume {
        match acq.resume(&config.xpacks_dir, Some(progress), on_completed)? {
            Some(handle) => handle,
            None => {
                info!(plugin = %acq.descriptor().description, "Nothing to resume");
                return Ok(());
            }
        }
    } else {
        let (width_m, height_m) = match args.size {
            Some(size) => size,
            None => bail!("--size is required when not resuming"),
        };
        let mut map = image_map(&path, args.width, args.height, args.origin);
        acq.set_coverage(&mut map, width_m, height_m).await?;
        map.validate()?;
        acq.size_updated(map.width, map.height).await?;
        info!(
            coverage_x = map.coverage_x,
            coverage_z = map.coverage_z,
            output = %map.main_path(&config.xpacks_dir).display(),
            "Starting image"
        );
        acq.create(&config.xpacks_dir, &map, Some(progress), on_completed)?
    };

    let outcome = tokio::select! {
        outcome = running.outcome() => Some(outcome),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; stopping acquisition");
            acq.stop().await
        }
    };

    // reap the worker before touching the plugin again
    acq.wait().await;

    let interrupted = outcome
        .as_ref()
        .map(|o| o.is_cancelled())
        .unwrap_or(true);
    acq.save(&settings, interrupted)
        .await
        .with_context(|| format!("Failed to save plugin settings to {}", settings.display()))?;

    match outcome {
        Some(o) if o.success() => Ok(()),
        Some(o) if o.is_cancelled() => {
            if acq.supports_interruptions() {
                info!("Run again with --resume to continue");
            }
            Ok(())
        }
        Some(o) => bail!(
            "Acquisition {}: {}",
            o.state,
            o.message.unwrap_or_else(|| "no details".to_string())
        ),
        None => {
            warn!("Acquisition worker exited without an outcome");
            Ok(())
        }
    }
}

/// Log progress every 10 percent per image type
fn progress_logger() -> ProgressCallback {
    let main = Arc::new(AtomicU32::new(0));
    let mask = Arc::new(AtomicU32::new(0));
    Arc::new(move |kind: ImageType, pct: f32| {
        let bucket = (pct / 10.0).floor() as u32;
        let last = match kind {
            ImageType::Main => &main,
            ImageType::Mask => &mask,
        };
        if last.fetch_max(bucket, Ordering::Relaxed) < bucket {
            info!(image = ?kind, percent = bucket * 10, "Progress");
        }
    })
}

/// Request an image named after the plugin module, under its own folder.
fn image_map(plugin: &Path, width: i32, height: i32, origin: (f64, f64)) -> ImageMapInformation {
    let stem = plugin
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let stem = stem.strip_prefix("lib").unwrap_or(&stem).to_string();

    ImageMapInformation {
        filename: format!("{stem}/{stem}.png"),
        filename_intermediate: format!("{stem}/{stem}_preview.png"),
        filename_mask: format!("{stem}/{stem}_mask.png"),
        filename_intermediate_mask: format!("{stem}/{stem}_mask_preview.png"),
        latitude: origin.0,
        longitude: origin.1,
        width,
        height,
        width_mask: width,
        height_mask: height,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_image_map_names_follow_module() {
        let map = image_map(Path::new("/p/ImageMap/libtb_rainbow_image.so"), 640, 480, (1.0, 2.0));
        assert_eq!(map.filename, "tb_rainbow_image/tb_rainbow_image.png");
        assert_eq!(map.filename_intermediate, "tb_rainbow_image/tb_rainbow_image_preview.png");
        assert_eq!((map.width, map.height), (640, 480));
        assert_eq!((map.latitude, map.longitude), (1.0, 2.0));
        assert_eq!((map.coverage_x, map.coverage_z), (0.0, 0.0));
    }
}
