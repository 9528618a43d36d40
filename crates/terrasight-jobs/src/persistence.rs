//! Durable storage of a job's results.
//!
//! The pipeline hands every finished job, full or partial, to a
//! [`Persistence`] implementation once all derivatives have reported. The
//! default [`ManifestStore`] writes an `analysis.json` manifest next to the
//! artifacts in the session directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use terrasight_analysis::TerrainStatistics;
use terrasight_dem::cache::write_atomic;
use terrasight_dem::ElevationSource;
use thiserror::Error;
use tracing::info;

pub const MANIFEST_FILE: &str = "analysis.json";

#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Writing to durable storage failed.
    #[error("write to {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialise results: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The store refused the results.
    #[error("results rejected: {0}")]
    Rejected(String),
}

/// Everything a store needs to record one job's results.
#[derive(Debug, Clone)]
pub struct PersistRequest {
    pub aoi_id: String,
    pub source: ElevationSource,
    pub session_dir: PathBuf,
    /// Artifact name -> file, including the clipped elevation and previews.
    pub artifacts: BTreeMap<String, PathBuf>,
    /// Derivative name -> failure reason.
    pub failed: BTreeMap<String, String>,
    pub statistics: Option<TerrainStatistics>,
}

pub trait Persistence: Send + Sync {
    fn persist(&self, job_id: &str, request: &PersistRequest) -> Result<(), PersistenceError>;
}

/// On-disk form of a persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisManifest {
    pub job_id: String,
    pub aoi_id: String,
    pub source: ElevationSource,
    pub artifacts: BTreeMap<String, PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failed_derivatives: BTreeMap<String, String>,
    pub statistics: Option<TerrainStatistics>,
    pub saved_at: DateTime<Utc>,
}

/// Writes one manifest per session directory, replacing any earlier one.
#[derive(Debug, Clone, Default)]
pub struct ManifestStore;

impl ManifestStore {
    pub fn new() -> Self {
        Self
    }

    pub fn manifest_path(session_dir: &Path) -> PathBuf {
        session_dir.join(MANIFEST_FILE)
    }

    /// Read back the manifest of a session, if one was saved.
    pub fn load(session_dir: &Path) -> Result<Option<AnalysisManifest>, PersistenceError> {
        let path = Self::manifest_path(session_dir);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }
}

impl Persistence for ManifestStore {
    fn persist(&self, job_id: &str, request: &PersistRequest) -> Result<(), PersistenceError> {
        let manifest = AnalysisManifest {
            job_id: job_id.to_string(),
            aoi_id: request.aoi_id.clone(),
            source: request.source,
            artifacts: request.artifacts.clone(),
            failed_derivatives: request.failed.clone(),
            statistics: request.statistics.clone(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        let path = Self::manifest_path(&request.session_dir);
        write_atomic(&path, &json).map_err(|source| PersistenceError::Io {
            path: path.clone(),
            source,
        })?;
        info!(
            job_id,
            artifacts = manifest.artifacts.len(),
            path = %path.display(),
            "saved analysis manifest"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(dir: &Path) -> PersistRequest {
        let mut artifacts = BTreeMap::new();
        artifacts.insert("elevation".to_string(), dir.join("clipped_dem.tif"));
        artifacts.insert("slope".to_string(), dir.join("slope.tif"));
        let mut failed = BTreeMap::new();
        failed.insert("contours".to_string(), "timed out after 300s".to_string());
        PersistRequest {
            aoi_id: "lot7".to_string(),
            source: ElevationSource::Srtm,
            session_dir: dir.to_path_buf(),
            artifacts,
            failed,
            statistics: None,
        }
    }

    #[test]
    fn test_manifest_written_and_loaded() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sessions").join("lot7");
        assert!(ManifestStore::load(&dir).unwrap().is_none());

        ManifestStore::new().persist("lot7-1", &request(&dir)).unwrap();
        let manifest = ManifestStore::load(&dir).unwrap().unwrap();
        assert_eq!(manifest.job_id, "lot7-1");
        assert_eq!(manifest.source, ElevationSource::Srtm);
        assert_eq!(manifest.artifacts.len(), 2);
        assert_eq!(manifest.failed_derivatives["contours"], "timed out after 300s");

        // Only the manifest is left behind, no temp files.
        let names: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from(MANIFEST_FILE)]);
    }

    #[test]
    fn test_unwritable_session_dir() {
        let tmp = tempfile::tempdir().unwrap();
        // A regular file where the session directory should be.
        let blocker = tmp.path().join("lot7");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let err = ManifestStore::new()
            .persist("lot7-1", &request(&blocker))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Io { .. }));
    }
}
