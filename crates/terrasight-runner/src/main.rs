use clap::Parser;
use std::process;
use std::time::Duration;
use terrasight_dem::ElevationSource;
use terrasight_jobs::JobTracker;
use terrasight_runner::cli::{Cli, Commands};
use terrasight_runner::logging::init_logging;
use terrasight_runner::{exit_code, load_aoi, load_config, resolve_tiles, run_to_completion, RunnerError};

fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(4);
    }
    install_metrics(cli.metrics_addr);

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "terrasight failed");
            eprintln!("error: {e}");
            process::exit(3);
        }
    }
}

#[cfg(feature = "prometheus")]
fn install_metrics(addr: Option<std::net::SocketAddr>) {
    match addr {
        Some(addr) => {
            if let Err(e) = terrasight_metrics::install_prometheus(addr) {
                tracing::warn!(error = %e, "metrics exporter not started");
            }
        }
        None => terrasight_metrics::describe_metrics(),
    }
}

#[cfg(not(feature = "prometheus"))]
fn install_metrics(addr: Option<std::net::SocketAddr>) {
    if addr.is_some() {
        tracing::warn!("--metrics-addr ignored: built without the prometheus feature");
    }
    terrasight_metrics::describe_metrics();
}

fn parse_source(id: &str) -> Result<ElevationSource, RunnerError> {
    Ok(id.parse::<ElevationSource>()?)
}

fn run(cli: Cli) -> Result<i32, RunnerError> {
    match cli.command {
        Commands::Sources => {
            for source in ElevationSource::ALL {
                println!(
                    "{:<9} {:>5.0} m  {}",
                    source.id(),
                    source.resolution_m(),
                    source.description()
                );
            }
            Ok(0)
        }
        Commands::CheckConfig => {
            let config = load_config(cli.config.as_deref())?;
            let yaml = serde_yaml::to_string(&config).map_err(terrasight_jobs::ConfigError::from)?;
            print!("{}", yaml);
            Ok(0)
        }
        Commands::Tiles(args) => {
            let config = load_config(cli.config.as_deref())?;
            let aoi = load_aoi(&args.aoi, args.id.as_deref())?;
            let set = resolve_tiles(&config, &aoi, parse_source(&args.source)?)?;
            for tile in &set.tiles {
                println!("{}\t{}", tile.crs, tile.path.display());
            }
            for name in &set.missing {
                println!("missing\t{}", name);
            }
            Ok(if set.is_empty() { 1 } else { 0 })
        }
        Commands::Run(args) => {
            let config = load_config(cli.config.as_deref())?;
            let aoi = load_aoi(&args.aoi.aoi, args.aoi.id.as_deref())?;
            let source = parse_source(&args.aoi.source)?;
            let tracker = JobTracker::from_config(config)?;
            let status = run_to_completion(
                &tracker,
                aoi,
                source,
                Duration::from_secs(args.timeout_secs),
            )?;
            let json = serde_json::to_string_pretty(&status).unwrap_or_default();
            if let Some(path) = &args.output {
                std::fs::write(path, &json).map_err(|source| RunnerError::Write {
                    path: path.clone(),
                    source,
                })?;
            }
            println!("{}", json);
            Ok(exit_code(&status))
        }
    }
}
