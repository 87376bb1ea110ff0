//! Terrain Builder plugin host
//!
//! Command-line front end over the plugin system:
//! - `plugins`: enumerate the plugin folders
//! - `heights`: sample a height plugin over a grid
//! - `image`: run (or resume) an image acquisition with Ctrl-C support

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tb_core::config::{load_environment, HostConfig};

mod catalog;
mod heights;
mod image;

#[derive(Parser, Debug)]
#[command(name = "tb-host")]
#[command(about = "Enumerate and drive terrain-builder image and height plugins")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Root holding the ImageMap/ and Height/ plugin folders
    #[arg(long, global = true)]
    plugins_root: Option<PathBuf>,

    /// Project folder; plugin settings live under <project>/Plugins/
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Folder image plugins write their artifacts into
    #[arg(long, global = true)]
    xpacks: Option<PathBuf>,

    /// Emit logs as JSON lines (also TB_LOG_JSON)
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List loadable plugins and the modules that failed to load
    Plugins {
        /// Print the enumeration as JSON
        #[arg(long)]
        json: bool,
    },

    /// Sample heights over a rectangle of the venue
    Heights(heights::HeightsArgs),

    /// Produce an image map with an image plugin
    Image(image::ImageArgs),
}

impl Args {
    fn host_config(&self) -> HostConfig {
        let mut config = HostConfig::from_env();
        if let Some(root) = &self.plugins_root {
            config.plugins_root = root.clone();
        }
        if let Some(project) = &self.project {
            config.project_dir = project.clone();
        }
        if let Some(xpacks) = &self.xpacks {
            config.xpacks_dir = xpacks.clone();
        }
        config.log_json |= self.log_json;
        config
    }
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("tb_host=info".parse()?)
        .add_directive("tb_dynamic_loader=info".parse()?)
        .add_directive("tb_plugins=info".parse()?);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from /etc/terrain-builder/environment (if exists)
    load_environment();

    let args = Args::parse();
    let config = args.host_config();
    init_tracing(config.log_json)?;

    match args.command {
        Commands::Plugins { json } => catalog::run(&config, json),
        Commands::Heights(cmd) => heights::run(&config, cmd).await,
        Commands::Image(cmd) => image::run(&config, cmd).await,
    }
}
