//! One job, start to finish: tile lookup, acquisition, derivative fan-out,
//! statistics and persistence.
//!
//! The pipeline never touches job state itself. It reports progress through
//! a callback and returns a [`JobOutcome`] that the tracker records.

use crate::config::PipelineConfig;
use crate::persistence::{PersistRequest, Persistence};
use crate::session::SessionLayout;
use crate::state::{progress, FailureKind, JobOutcome};
use std::path::Path;
use std::sync::Arc;
use terrasight_analysis::{
    compute_statistics, AnalysisEngine, Derivative, DerivativeOutcome, FanOutReport,
    FanOutRequest, FanOutScheduler, TerrainStatistics,
};
use terrasight_dem::tile_index::TileFetcher;
use terrasight_dem::{
    acquire, AcquisitionError, AcquisitionStage, AreaOfInterest, ClippedElevation,
    DemError, ElevationSource, Raster, TileIndexSet, WORKING_CRS,
};
use tracing::{info, warn};

/// Artifact name of the clipped elevation file.
pub const ELEVATION_ARTIFACT: &str = "elevation";

/// Shared, long-lived pieces every job runs against.
pub struct Pipeline {
    config: PipelineConfig,
    indexes: TileIndexSet,
    scheduler: FanOutScheduler,
    persistence: Arc<dyn Persistence>,
    layout: SessionLayout,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        engine: Arc<dyn AnalysisEngine>,
        fetcher: Arc<dyn TileFetcher>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let indexes = TileIndexSet::new(&config.sources, fetcher);
        let scheduler = FanOutScheduler::new(config.scheduler.clone(), engine);
        let layout = SessionLayout::new(&config.data_dir);
        Self {
            config,
            indexes,
            scheduler,
            persistence,
            layout,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    /// Execute one job. `report(progress, message)` is called at every stage
    /// boundary with non-decreasing progress values.
    pub fn run<R>(
        &self,
        job_id: &str,
        aoi: &AreaOfInterest,
        source: ElevationSource,
        mut report: R,
    ) -> JobOutcome
    where
        R: FnMut(u8, String),
    {
        report(
            progress::ACQUISITION_STARTED,
            format!("resolving {} tiles", source),
        );
        let clipped = match self.acquire(aoi, source, &mut report) {
            Ok(clipped) => clipped,
            Err(e) => {
                warn!(job_id, source = %source, error = %e, "acquisition failed");
                return JobOutcome::acquisition_failed(e.to_string());
            }
        };
        let elevation_path = clipped.path.clone();
        let elevation = Arc::new(clipped.raster);

        report(
            progress::DERIVATIVES_STARTED,
            "computing terrain derivatives".to_string(),
        );
        let request = FanOutRequest {
            source_id: source.id().to_string(),
            elevation_path: elevation_path.clone(),
            elevation: Arc::clone(&elevation),
            footprint: aoi.footprint().clone(),
            output_dir: self.layout.session_dir(aoi.id()),
            derivatives: Derivative::ALL.to_vec(),
            contour_interval: self.config.contour_interval,
        };
        let fan_out = self.scheduler.run(&request, |derivative, outcome, done, total| {
            let verb = if outcome.is_success() { "finished" } else { "failed" };
            report(
                progress::derivatives(done, total),
                format!("{} {} ({}/{})", derivative, verb, done, total),
            );
        });

        let statistics = statistics(&elevation, &fan_out);
        let mut artifacts = fan_out.artifacts();
        artifacts.insert(ELEVATION_ARTIFACT.to_string(), elevation_path);
        let failed = fan_out.failures();

        report(progress::PERSISTING, "saving results".to_string());
        let persist = PersistRequest {
            aoi_id: aoi.id().to_string(),
            source,
            session_dir: self.layout.session_dir(aoi.id()),
            artifacts: artifacts.clone(),
            failed: failed.clone(),
            statistics,
        };
        if let Err(e) = self.persistence.persist(job_id, &persist) {
            warn!(job_id, error = %e, "results computed but could not be saved");
            return JobOutcome::Failed {
                kind: FailureKind::Persistence,
                message: format!("results computed but not saved: {}", e),
                artifacts,
                failed,
            };
        }

        if failed.is_empty() {
            JobOutcome::Succeeded { artifacts }
        } else {
            JobOutcome::PartiallySucceeded { artifacts, failed }
        }
    }

    fn acquire<R>(
        &self,
        aoi: &AreaOfInterest,
        source: ElevationSource,
        report: &mut R,
    ) -> Result<ClippedElevation, AcquisitionError>
    where
        R: FnMut(u8, String),
    {
        let tile_set = self
            .indexes
            .get(source)
            .resolve(aoi)
            .map_err(AcquisitionError::Index)?;
        let message = if tile_set.missing.is_empty() {
            format!("{} tiles found", tile_set.tiles.len())
        } else {
            format!(
                "{} tiles found, {} unavailable: {}",
                tile_set.tiles.len(),
                tile_set.missing.len(),
                tile_set.missing.join(", ")
            )
        };
        report(progress::TILES_RESOLVED, message);
        if tile_set.is_empty() {
            return Err(AcquisitionError::NoTiles {
                source_id: source.id().to_string(),
            });
        }

        let session_dir = self.layout.session_dir(aoi.id());
        std::fs::create_dir_all(&session_dir).map_err(|e| AcquisitionError::Raster(DemError::from(e)))?;
        let clipped = acquire(
            &tile_set.tiles,
            aoi,
            source.id(),
            self.config.clip_buffer_pixels,
            &session_dir,
            |stage| {
                let (value, message) = match stage {
                    AcquisitionStage::TilesLoaded { count } => {
                        (progress::TILES_LOADED, format!("{} tiles loaded", count))
                    }
                    AcquisitionStage::Mosaicked => (progress::MOSAICKED, "mosaic built".to_string()),
                    AcquisitionStage::Normalized => {
                        (progress::NORMALIZED, format!("reprojected to {}", WORKING_CRS))
                    }
                    AcquisitionStage::Clipped => {
                        (progress::CLIPPED, "clipped to area of interest".to_string())
                    }
                };
                report(value, message);
            },
        )?;
        info!(
            aoi = aoi.id(),
            width = clipped.raster.width(),
            height = clipped.raster.height(),
            "clipped elevation ready"
        );
        Ok(clipped)
    }
}

/// Terrain statistics from the elevation plus whichever of slope and aspect
/// succeeded. Failing to summarise never fails the job.
fn statistics(elevation: &Raster, fan_out: &FanOutReport) -> Option<TerrainStatistics> {
    let load = |d: Derivative| match fan_out.outcomes.get(&d) {
        Some(DerivativeOutcome::Succeeded { path, .. }) => read_derivative(path),
        _ => None,
    };
    let slope = load(Derivative::Slope);
    let aspect = load(Derivative::Aspect);
    match compute_statistics(elevation, slope.as_ref(), aspect.as_ref()) {
        Ok(stats) => Some(stats),
        Err(e) => {
            warn!(error = %e, "terrain statistics unavailable");
            None
        }
    }
}

fn read_derivative(path: &Path) -> Option<Raster> {
    match Raster::from_geotiff(path, WORKING_CRS) {
        Ok(raster) => Some(raster),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read derivative for statistics");
            None
        }
    }
}

/// Artifact names a fully successful job produces.
pub fn expected_artifacts() -> Vec<String> {
    let mut names: Vec<String> = Derivative::ALL
        .iter()
        .flat_map(|d| [d.name().to_string(), format!("{}_preview", d.name())])
        .collect();
    names.push(ELEVATION_ARTIFACT.to_string());
    names.sort();
    names
}
