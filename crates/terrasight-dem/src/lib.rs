//! Elevation acquisition for terrain analysis.
//!
//! This crate turns an area of interest plus an elevation source into a
//! single clipped elevation raster:
//!
//! 1. [`tile_index`] resolves the AOI to raw tiles, downloading grid tiles
//!    into a shared cache or scanning a local archive.
//! 2. [`crs::normalize`] brings rasters into the working CRS (WGS84).
//! 3. [`mosaic`] composites the tiles and clips them to the polygon.
//!
//! Rasters are held in memory as `f32` bands; GeoTIFF and SRTM `.hgt` are
//! the supported file formats.

pub mod cache;
pub mod crs;
pub mod error;
pub mod geometry;
pub mod hgt;
pub mod mosaic;
pub mod raster;
pub mod source;
pub mod tile_index;

pub use crs::{normalize, CoordTransformer, Crs};
pub use error::{AcquisitionError, DemError};
pub use geometry::{AreaOfInterest, BoundingBox, Footprint};
pub use mosaic::{acquire, clip, mosaic, AcquisitionStage, ClippedElevation, CLIPPED_DEM_FILE};
pub use raster::{GeoTiffHeader, GeoTransform, Raster};
pub use source::{ElevationSource, TileStrategy};
pub use tile_index::{RawTile, SourceOptions, TileIndex, TileIndexSet, TileSet};

/// Nodata value written to every raster this crate produces.
pub const NODATA: f32 = -9999.0;

/// CRS of areas of interest and of every acquisition output.
pub const WORKING_CRS: Crs = Crs::WGS84;

/// Result type for DEM operations.
pub type Result<T> = std::result::Result<T, DemError>;
