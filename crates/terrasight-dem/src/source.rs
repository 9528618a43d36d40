//! Elevation data sources.

use crate::crs::Crs;
use crate::DemError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a source maps an area of interest to tile files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStrategy {
    /// Tile names computed from integer lat/lon cells.
    GridNaming,
    /// Headers of an irregular file archive scanned for overlap.
    SpatialScan,
    /// Products listed by a remote catalogue API.
    ApiQuery,
}

/// One of the supported elevation datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElevationSource {
    /// Global 1 arc-second SRTM, addressed by 1x1 degree cell names.
    #[serde(rename = "srtm")]
    Srtm,
    /// High-resolution regional LiDAR archive stored in a projected CRS.
    #[serde(rename = "lidar")]
    LidarArchive,
    /// USGS 3DEP products located through The National Map API.
    #[serde(rename = "usgs-dem")]
    Usgs3dep,
}

impl ElevationSource {
    pub const ALL: [ElevationSource; 3] = [
        ElevationSource::Srtm,
        ElevationSource::LidarArchive,
        ElevationSource::Usgs3dep,
    ];

    /// Stable identifier used in configs, metrics and file names.
    pub fn id(&self) -> &'static str {
        match self {
            ElevationSource::Srtm => "srtm",
            ElevationSource::LidarArchive => "lidar",
            ElevationSource::Usgs3dep => "usgs-dem",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ElevationSource::Srtm => "SRTM 1 arc-second global elevation",
            ElevationSource::LidarArchive => "LiDAR regional archive (1 m)",
            ElevationSource::Usgs3dep => "USGS 3DEP elevation via The National Map",
        }
    }

    /// CRS the source's files are usually stored in. Individual archive or
    /// API files may override this through their own GeoTIFF keys.
    pub fn native_crs(&self) -> Crs {
        match self {
            ElevationSource::Srtm => Crs::WGS84,
            ElevationSource::LidarArchive => Crs::PT_TM06,
            ElevationSource::Usgs3dep => Crs::NAD83,
        }
    }

    /// Nominal ground resolution in metres.
    pub fn resolution_m(&self) -> f64 {
        match self {
            ElevationSource::Srtm => 30.0,
            ElevationSource::LidarArchive => 1.0,
            ElevationSource::Usgs3dep => 10.0,
        }
    }

    pub fn strategy(&self) -> TileStrategy {
        match self {
            ElevationSource::Srtm => TileStrategy::GridNaming,
            ElevationSource::LidarArchive => TileStrategy::SpatialScan,
            ElevationSource::Usgs3dep => TileStrategy::ApiQuery,
        }
    }
}

impl fmt::Display for ElevationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ElevationSource {
    type Err = DemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "srtm" => Ok(ElevationSource::Srtm),
            "lidar" | "lidarpt" => Ok(ElevationSource::LidarArchive),
            "usgs-dem" | "usgs" | "3dep" => Ok(ElevationSource::Usgs3dep),
            _ => Err(DemError::UnknownSource(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_round_trip() {
        for source in ElevationSource::ALL {
            assert_eq!(source.id().parse::<ElevationSource>().unwrap(), source);
        }
        assert!("landsat".parse::<ElevationSource>().is_err());
    }

    #[test]
    fn test_serde_uses_ids() {
        let json = serde_json::to_string(&ElevationSource::Usgs3dep).unwrap();
        assert_eq!(json, "\"usgs-dem\"");
    }

    #[test]
    fn test_strategies() {
        assert_eq!(ElevationSource::Srtm.strategy(), TileStrategy::GridNaming);
        assert_eq!(ElevationSource::LidarArchive.strategy(), TileStrategy::SpatialScan);
        assert!(!ElevationSource::LidarArchive.native_crs().is_geographic());
    }
}
