//! Pipeline configuration loaded from YAML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Credentials never live here; see
//! [`terrasight_dem::tile_index::HttpFetcher::from_env`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use terrasight_analysis::scheduler::{MAX_TIMEOUT_SECS, MAX_WORKERS, MIN_WORKERS};
use terrasight_analysis::{EngineConfig, SchedulerConfig, DEFAULT_CONTOUR_INTERVAL};
use terrasight_dem::SourceOptions;
use thiserror::Error;

/// Overrides `data_dir` when set.
pub const DATA_DIR_ENV: &str = "TERRASIGHT_DATA_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root for session directories (`{data_dir}/sessions/{aoi_id}`).
    pub data_dir: PathBuf,
    /// Per-source tile index settings (`srtm`, `lidar`, `usgs`).
    #[serde(flatten)]
    pub sources: SourceOptions,
    pub scheduler: SchedulerConfig,
    pub engine: EngineConfig,
    /// How long a job stays pollable, counted from its creation.
    pub retention_secs: u64,
    /// How often expired jobs are reclaimed.
    pub reaper_interval_secs: u64,
    /// Polygon buffer for the clip mask, in source pixels.
    pub clip_buffer_pixels: f64,
    pub contour_interval: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            sources: SourceOptions::default(),
            scheduler: SchedulerConfig::default(),
            engine: EngineConfig::default(),
            retention_secs: 3600,
            reaper_interval_secs: 60,
            clip_buffer_pixels: 0.5,
            contour_interval: DEFAULT_CONTOUR_INTERVAL,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserialises as unit, not as a mapping.
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Apply environment overrides.
    pub fn with_env(mut self) -> Self {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.clip_buffer_pixels >= 0.0 && self.clip_buffer_pixels.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "clip_buffer_pixels must be >= 0, got {}",
                self.clip_buffer_pixels
            )));
        }
        let timeout = self.scheduler.timeout_secs;
        if !(timeout > 0.0 && timeout <= MAX_TIMEOUT_SECS) {
            return Err(ConfigError::Invalid(format!(
                "scheduler.timeout_secs must be in (0, {}], got {}",
                MAX_TIMEOUT_SECS, timeout
            )));
        }
        if let Some(n) = self.scheduler.workers {
            if !(MIN_WORKERS..=MAX_WORKERS).contains(&n) {
                return Err(ConfigError::Invalid(format!(
                    "scheduler.workers must be between {} and {}, got {}",
                    MIN_WORKERS, MAX_WORKERS, n
                )));
            }
        }
        if !(self.contour_interval > 0.0) {
            return Err(ConfigError::Invalid(
                "contour_interval must be positive".to_string(),
            ));
        }
        if self.retention_secs == 0 || self.reaper_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "retention_secs and reaper_interval_secs must be positive".to_string(),
            ));
        }
        if self.sources.srtm.mirrors.is_empty() && !self.sources.srtm.offline {
            return Err(ConfigError::Invalid(
                "srtm.mirrors is empty and offline mode is off".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_empty_yaml_is_default() {
        let config = PipelineConfig::from_yaml_str("").unwrap();
        assert_eq!(config.retention_secs, 3600);
        assert_eq!(config.clip_buffer_pixels, 0.5);
        assert_eq!(config.sources.srtm.buffer_deg, 0.1);
        assert_eq!(config.sources.srtm.mirrors.len(), 2);
        assert_eq!(config.sources.lidar.epsg, 3763);
        assert_eq!(config.sources.usgs.max_products, 20);
        assert_eq!(config.scheduler.timeout_secs, 300.0);
        assert!(config.engine.commands.contains_key("contours"));
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
data_dir: /srv/terrain
srtm:
  offline: true
  cache_dir: /srv/srtm
lidar:
  archive_dir: /srv/lidar
  index_file: /srv/lidar/index.json
scheduler:
  workers: 5
  timeout_secs: 120
retention_secs: 600
"#;
        let config = PipelineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/terrain"));
        assert!(config.sources.srtm.offline);
        assert_eq!(config.sources.srtm.cache_dir, PathBuf::from("/srv/srtm"));
        // Untouched nested fields keep their defaults.
        assert_eq!(config.sources.srtm.mirrors.len(), 2);
        assert_eq!(
            config.sources.lidar.index_file,
            Some(PathBuf::from("/srv/lidar/index.json"))
        );
        assert_eq!(config.scheduler.workers, Some(5));
        assert_eq!(config.retention_secs, 600);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            PipelineConfig::from_yaml_str("clip_buffer_pixels: -1"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            PipelineConfig::from_yaml_str("scheduler:\n  timeout_secs: 0"),
            Err(ConfigError::Invalid(_))
        ));
        for timeout in [".inf", "-.inf", ".nan", "1e20", "86401"] {
            let yaml = format!("scheduler:\n  timeout_secs: {}", timeout);
            assert!(
                matches!(PipelineConfig::from_yaml_str(&yaml), Err(ConfigError::Invalid(_))),
                "timeout_secs {} accepted",
                timeout
            );
        }
        for workers in ["0", "2", "7", "64"] {
            let yaml = format!("scheduler:\n  workers: {}", workers);
            assert!(
                matches!(PipelineConfig::from_yaml_str(&yaml), Err(ConfigError::Invalid(_))),
                "workers {} accepted",
                workers
            );
        }
        assert!(PipelineConfig::from_yaml_str("scheduler:\n  workers: 6\n  timeout_secs: 86400").is_ok());
        assert!(matches!(
            PipelineConfig::from_yaml_str("retention_secs: [1, 2]"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    #[serial]
    fn test_data_dir_env_override() {
        std::env::set_var(DATA_DIR_ENV, "/tmp/terrasight-env");
        let config = PipelineConfig::default().with_env();
        std::env::remove_var(DATA_DIR_ENV);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/terrasight-env"));
        assert_eq!(PipelineConfig::default().with_env().data_dir, PathBuf::from("data"));
    }
}
