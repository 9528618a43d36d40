//! Command-line arguments.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Terrain acquisition and derivative pipeline.
#[derive(Parser, Debug)]
#[command(name = "terrasight")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Pipeline configuration (YAML). Defaults apply when omitted.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Serve Prometheus metrics on this address (needs the `prometheus`
    /// feature).
    #[arg(long, global = true)]
    pub metrics_addr: Option<std::net::SocketAddr>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one job to completion and print its final status as JSON.
    Run(RunArgs),

    /// List the tiles that cover an area of interest without processing it.
    Tiles(AoiArgs),

    /// List the supported elevation sources.
    Sources,

    /// Load and validate the configuration, then print it.
    CheckConfig,
}

#[derive(Args, Debug, Clone)]
pub struct AoiArgs {
    /// GeoJSON file holding the area-of-interest polygon.
    #[arg(long)]
    pub aoi: PathBuf,

    /// Elevation source id (srtm, lidar, usgs-dem).
    #[arg(long, default_value = "srtm")]
    pub source: String,

    /// AOI id; names the session directory. Defaults to the file stem.
    #[arg(long)]
    pub id: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub aoi: AoiArgs,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value_t = 3600)]
    pub timeout_secs: u64,

    /// Also write the final status JSON to this file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}
