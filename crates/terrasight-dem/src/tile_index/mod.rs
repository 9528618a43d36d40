//! Resolving an area of interest to the raw tile files that cover it.
//!
//! Each elevation source has its own addressing scheme:
//! - [`grid::SrtmIndex`] derives tile names from integer lat/lon cells and
//!   downloads misses from an ordered mirror list.
//! - [`archive::ArchiveIndex`] scans the headers of a large irregular
//!   archive once and filters them against the AOI, cheap box test first.
//! - [`api::UsgsIndex`] asks a product catalogue which files cover the AOI.

pub mod api;
pub mod archive;
pub mod grid;

use crate::crs::Crs;
use crate::geometry::{AreaOfInterest, BoundingBox};
use crate::hgt::read_hgt;
use crate::raster::Raster;
use crate::source::ElevationSource;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

pub use api::{UsgsIndex, UsgsOptions};
pub use archive::{ArchiveEntry, ArchiveIndex, ArchiveOptions};
pub use grid::{HttpFetcher, SrtmIndex, SrtmOptions, SrtmTile, TileFetcher};

/// On-disk encoding of a raw tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TileFormat {
    GeoTiff,
    Hgt,
}

/// A single source file. Read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTile {
    pub path: PathBuf,
    pub crs: Crs,
    pub bounds: BoundingBox,
    /// Pixel size (x, y) in CRS units.
    pub resolution: (f64, f64),
    pub format: TileFormat,
}

impl RawTile {
    /// Decode the tile's pixels.
    pub fn load(&self) -> Result<Raster> {
        match self.format {
            TileFormat::Hgt => read_hgt(&self.path),
            TileFormat::GeoTiff => Raster::from_geotiff(&self.path, self.crs),
        }
    }
}

/// Outcome of a lookup: the tiles found plus names of expected tiles that
/// could not be obtained. An empty `tiles` list is a valid answer.
#[derive(Debug, Clone, Default)]
pub struct TileSet {
    pub tiles: Vec<RawTile>,
    pub missing: Vec<String>,
}

impl TileSet {
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}

/// Maps an area of interest to raw tiles for one elevation source.
pub trait TileIndex: Send + Sync {
    fn source(&self) -> ElevationSource;

    fn resolve(&self, aoi: &AreaOfInterest) -> Result<TileSet>;
}

/// Per-source index settings, as they appear in the pipeline config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceOptions {
    pub srtm: SrtmOptions,
    pub lidar: ArchiveOptions,
    pub usgs: UsgsOptions,
}

/// One long-lived index per source, shared by every job so caches (the
/// archive header scan, in-flight downloads) are reused.
pub struct TileIndexSet {
    srtm: SrtmIndex,
    lidar: ArchiveIndex,
    usgs: UsgsIndex,
}

impl TileIndexSet {
    pub fn new(options: &SourceOptions, fetcher: Arc<dyn TileFetcher>) -> Self {
        Self {
            srtm: SrtmIndex::new(options.srtm.clone(), Arc::clone(&fetcher)),
            lidar: ArchiveIndex::new(options.lidar.clone()),
            usgs: UsgsIndex::new(options.usgs.clone(), fetcher),
        }
    }

    pub fn get(&self, source: ElevationSource) -> &dyn TileIndex {
        match source {
            ElevationSource::Srtm => &self.srtm,
            ElevationSource::LidarArchive => &self.lidar,
            ElevationSource::Usgs3dep => &self.usgs,
        }
    }
}
