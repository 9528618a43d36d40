//! Error types for the DEM crate.

use crate::crs::Crs;
use thiserror::Error;

/// Errors raised by raster I/O, geometry parsing, reprojection and tile lookup.
#[derive(Debug, Error)]
pub enum DemError {
    /// I/O error reading or writing a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TIFF decoding or encoding error.
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    /// Invalid GeoTIFF - missing or malformed georeferencing tags.
    #[error("Invalid GeoTIFF: {0}")]
    InvalidGeoTiff(String),

    /// Invalid SRTM height file.
    #[error("Invalid HGT file {path}: {reason}")]
    InvalidHgt {
        /// Offending file.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Raster dimensions or band layout are inconsistent.
    #[error("Invalid raster: {0}")]
    InvalidRaster(String),

    /// Area-of-interest geometry could not be parsed or is degenerate.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// JSON (GeoJSON, API response, index file) could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The CRS has no known projection definition.
    #[error("Unsupported CRS {0}")]
    UnsupportedCrs(Crs),

    /// A coordinate transformation failed.
    #[error("Reprojection from {from} to {to} failed: {reason}")]
    Reprojection {
        /// Source CRS.
        from: Crs,
        /// Target CRS.
        to: Crs,
        /// Underlying failure.
        reason: String,
    },

    /// Invalid tile filename - cannot parse grid coordinates.
    #[error("Invalid tile name: {0}")]
    InvalidTileName(String),

    /// Unknown elevation source identifier.
    #[error("Unknown elevation source '{0}'")]
    UnknownSource(String),

    /// HTTP request error when fetching tiles or querying an API.
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// Archive extraction error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A catalogue API answered with something unusable.
    #[error("Catalogue API error: {0}")]
    Api(String),

    /// Failed to download a tile from every configured location.
    #[error("Failed to download tile {tile}: {reason}")]
    TileDownloadFailed {
        /// Tile name.
        tile: String,
        /// Reason for the last failure.
        reason: String,
    },
}

/// Terminal failures of the acquisition stage (tile lookup through clip).
///
/// Any of these blocks all derivative work for the job.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    /// The tile index found nothing covering the area of interest.
    #[error("no {source_id} tiles intersect the area of interest")]
    NoTiles {
        /// Elevation source id.
        source_id: String,
    },

    /// Tiles were found but none of them could be decoded.
    #[error("all {count} tiles were unreadable (last error: {reason})")]
    AllTilesUnreadable {
        /// Number of tiles attempted.
        count: usize,
        /// Last decode error.
        reason: String,
    },

    /// Inputs that must share a CRS did not.
    #[error("CRS mismatch: expected {expected}, found {found}")]
    CrsMismatch {
        /// CRS required by the operation.
        expected: Crs,
        /// CRS actually encountered.
        found: Crs,
    },

    /// The composite grid would exceed the cell budget.
    #[error("mosaic of {cells} cells exceeds the limit of {limit}")]
    TooLarge {
        /// Cells the composite would need.
        cells: f64,
        /// Largest composite allowed.
        limit: usize,
    },

    /// The polygon mask left no valid pixels.
    #[error("clip produced no valid pixels inside the area of interest")]
    EmptyClip,

    /// The tile index itself failed.
    #[error("tile index failed: {0}")]
    Index(#[source] DemError),

    /// Raster processing failed.
    #[error(transparent)]
    Raster(#[from] DemError),
}
