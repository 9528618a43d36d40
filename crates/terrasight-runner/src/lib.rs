//! Library side of the `terrasight` command: loading inputs, running a
//! job to completion and listing tiles.

pub mod cli;
pub mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use terrasight_dem::tile_index::HttpFetcher;
use terrasight_dem::{AreaOfInterest, DemError, ElevationSource, TileIndexSet, TileSet};
use terrasight_jobs::{ConfigError, JobState, JobStatus, JobTracker, PipelineConfig, SubmitError};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Dem(#[from] DemError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error("job {job_id} still {state} after {secs}s")]
    Timeout {
        job_id: String,
        state: JobState,
        secs: u64,
    },

    #[error("job {0} disappeared before finishing")]
    Lost(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Configuration from `path` (or defaults), with environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    let config = config.with_env();
    config.validate()?;
    Ok(config)
}

/// Read an AOI polygon. Without an explicit id the file stem is used.
pub fn load_aoi(path: &Path, id: Option<&str>) -> Result<AreaOfInterest> {
    let text = std::fs::read_to_string(path).map_err(|source| RunnerError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let id = match id {
        Some(id) => id.to_string(),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "aoi".to_string()),
    };
    Ok(AreaOfInterest::from_geojson(id, &text)?)
}

/// Submit one job and block until it is terminal, logging progress.
pub fn run_to_completion(
    tracker: &JobTracker,
    aoi: AreaOfInterest,
    source: ElevationSource,
    timeout: Duration,
) -> Result<JobStatus> {
    let job_id = tracker.submit(aoi, source)?;
    let deadline = Instant::now() + timeout;
    let mut last_progress = None;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = tracker
            .wait(&job_id, remaining.min(Duration::from_secs(1)))
            .ok_or_else(|| RunnerError::Lost(job_id.clone()))?;
        if last_progress != Some(status.progress) {
            info!(job_id = %job_id, progress = status.progress, message = %status.message, "progress");
            last_progress = Some(status.progress);
        }
        if status.state.is_terminal() {
            return Ok(status);
        }
        if remaining.is_zero() {
            return Err(RunnerError::Timeout {
                job_id,
                state: status.state,
                secs: timeout.as_secs(),
            });
        }
    }
}

/// Resolve tiles for an AOI without running a job. May download.
pub fn resolve_tiles(
    config: &PipelineConfig,
    aoi: &AreaOfInterest,
    source: ElevationSource,
) -> Result<TileSet> {
    let indexes = TileIndexSet::new(&config.sources, Arc::new(HttpFetcher::from_env()?));
    Ok(indexes.get(source).resolve(aoi)?)
}

/// Process exit code for a terminal job.
pub fn exit_code(status: &JobStatus) -> i32 {
    match status.state {
        JobState::Succeeded => 0,
        JobState::PartiallySucceeded => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: &str = r#"{"type":"Polygon","coordinates":[[[0.2,0.2],[0.8,0.2],[0.8,0.8],[0.2,0.8],[0.2,0.2]]]}"#;

    #[test]
    fn test_aoi_id_defaults_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("north-field.geojson");
        std::fs::write(&path, SQUARE).unwrap();
        assert_eq!(load_aoi(&path, None).unwrap().id(), "north-field");
        assert_eq!(load_aoi(&path, Some("lot9")).unwrap().id(), "lot9");
        assert!(matches!(
            load_aoi(&dir.path().join("absent.geojson"), None),
            Err(RunnerError::Read { .. })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(&path, "contour_interval: -5\n").unwrap();
        assert!(matches!(
            load_config(Some(&path)),
            Err(RunnerError::Config(ConfigError::Invalid(_)))
        ));
    }
}
