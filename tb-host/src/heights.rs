//! `heights` command: sample a height plugin over a rectangular grid

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::{info, warn};

use tb_core::{is_unknown_height, HostConfig, LatLong};
use tb_dynamic_loader::{settings_path, PluginLoader};
use tb_plugins::{coordinates_for, Plugin, PluginFamily};

use crate::catalog::{parse_pair, resolve_plugin};

#[derive(Args, Debug)]
pub struct HeightsArgs {
    /// Module file name in the Height/ folder, or a path to it
    #[arg(long)]
    plugin: String,

    /// Grid corner as x,z meters from the venue centre
    #[arg(long, value_parser = parse_pair, allow_hyphen_values = true)]
    from: (f64, f64),

    /// Opposite grid corner as x,z meters
    #[arg(long, value_parser = parse_pair, allow_hyphen_values = true)]
    to: (f64, f64),

    /// Grid spacing in meters
    #[arg(long, default_value_t = 10.0)]
    step: f64,

    /// Venue centre as lat,lon for plugins that take geographic coordinates
    #[arg(long, value_parser = parse_pair, allow_hyphen_values = true, default_value = "0,0")]
    origin: (f64, f64),

    /// Print samples as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
struct Sample {
    x: f64,
    z: f64,
    height: Option<f64>,
}

pub async fn run(config: &HostConfig, args: HeightsArgs) -> Result<()> {
    let points = grid(args.from, args.to, args.step)?;
    let path = resolve_plugin(&config.plugins_root, PluginFamily::Height, &args.plugin);

    let mut handle = PluginLoader::new()
        .load_height(&path)
        .with_context(|| format!("Failed to load height plugin {}", path.display()))?;
    let settings = settings_path(&config.project_dir, PluginFamily::Height, &handle.record());
    if let Err(e) = handle.plugin_mut().load(&settings) {
        warn!(path = %settings.display(), error = %e, "Failed to load plugin settings; using defaults");
    }

    let mut query = handle.into_query();
    let origin = LatLong::from(args.origin);
    let method = query.input_method();
    info!(
        plugin = %query.descriptor().description,
        input_method = ?method,
        samples = points.len(),
        max_pairs = query.maximum_pair_count(),
        "Sampling heights"
    );

    let pairs: Vec<LatLong> = points
        .iter()
        .map(|&(x, z)| coordinates_for(method, x, z, origin))
        .collect();

    // the query sleeps between requests, keep it off the async workers
    let heights = tokio::task::spawn_blocking(move || {
        query.fetch_all(pairs, |done, total| {
            info!(done, total, "Fetched height chunk");
        })
    })
    .await
    .context("Height sampling task failed")?;

    let samples: Vec<Sample> = points
        .iter()
        .zip(heights)
        .map(|(&(x, z), h)| Sample {
            x,
            z,
            height: (!is_unknown_height(h)).then_some(h),
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&samples)?);
    } else {
        for s in &samples {
            match s.height {
                Some(h) => println!("{:>12.2} {:>12.2} {:>12.3}", s.x, s.z, h),
                None => println!("{:>12.2} {:>12.2} {:>12}", s.x, s.z, "unknown"),
            }
        }
    }
    Ok(())
}

/// Row-major grid points between two corners, inclusive of both ends.
fn grid(from: (f64, f64), to: (f64, f64), step: f64) -> Result<Vec<(f64, f64)>> {
    if !(step.is_finite() && step > 0.0) {
        bail!("step must be a positive number of meters, got {}", step);
    }

    let axis = |a: f64, b: f64| -> Vec<f64> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let count = ((hi - lo) / step).floor() as usize;
        (0..=count).map(|i| lo + i as f64 * step).collect()
    };

    let xs = axis(from.0, to.0);
    let zs = axis(from.1, to.1);
    Ok(zs
        .iter()
        .flat_map(|&z| xs.iter().map(move |&x| (x, z)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_grid_is_row_major_and_inclusive() {
        let points = grid((0.0, 0.0), (20.0, 10.0), 10.0).unwrap();
        assert_eq!(
            points,
            vec![
                (0.0, 0.0),
                (10.0, 0.0),
                (20.0, 0.0),
                (0.0, 10.0),
                (10.0, 10.0),
                (20.0, 10.0)
            ]
        );
    }

    #[test]
    fn test_grid_accepts_reversed_corners() {
        let points = grid((10.0, -5.0), (0.0, -5.0), 5.0).unwrap();
        assert_eq!(points, vec![(0.0, -5.0), (5.0, -5.0), (10.0, -5.0)]);
    }

    #[test]
    fn test_grid_rejects_bad_step() {
        assert!(grid((0.0, 0.0), (1.0, 1.0), 0.0).is_err());
        assert!(grid((0.0, 0.0), (1.0, 1.0), f64::NAN).is_err());
    }
}
