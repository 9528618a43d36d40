//! Terrain statistics stored alongside the artifacts.

use crate::error::{AnalysisError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution, Max, Min};
use terrasight_dem::{BoundingBox, Raster};

/// Metres per degree of latitude on the WGS84 mean sphere.
const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElevationStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    /// max - min.
    pub relief: f64,
    /// Standard deviation of elevation, used as a ruggedness index.
    pub ruggedness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlopeStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AspectStats {
    /// Circular mean in degrees clockwise from north.
    pub mean_deg: f64,
    /// Eight-way compass direction of the mean.
    pub direction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerrainStatistics {
    pub elevation: ElevationStats,
    pub slope: Option<SlopeStats>,
    pub aspect: Option<AspectStats>,
    pub pixel_count: usize,
    pub area_km2: f64,
    pub bounds: BoundingBox,
    pub processed_at: DateTime<Utc>,
}

fn summarize(values: Vec<f64>) -> Option<(f64, f64, f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let data = Data::new(values);
    let mean = data.mean()?;
    // Sample std is undefined for one value.
    let std = data.std_dev().filter(|s| s.is_finite()).unwrap_or(0.0);
    Some((data.min(), data.max(), mean, std))
}

fn valid(raster: &Raster) -> Vec<f64> {
    raster.valid_values(0).map(f64::from).collect()
}

/// Eight-way compass name for a bearing in degrees.
pub fn compass_direction(degrees: f64) -> &'static str {
    const NAMES: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];
    let sector = ((degrees.rem_euclid(360.0) + 22.5) / 45.0) as usize % 8;
    NAMES[sector]
}

/// Circular mean of bearings in degrees; flat cells (negative) are skipped.
pub fn circular_mean_deg(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (mut s, mut c, mut n) = (0.0, 0.0, 0usize);
    for v in values.into_iter().filter(|v| *v >= 0.0) {
        let r = v.to_radians();
        s += r.sin();
        c += r.cos();
        n += 1;
    }
    if n == 0 || (s.abs() < 1e-12 && c.abs() < 1e-12) {
        return None;
    }
    Some(s.atan2(c).to_degrees().rem_euclid(360.0))
}

/// Ground area covered by valid pixels in square kilometres.
///
/// Geographic rasters use the latitude cosine at the raster's centre.
pub fn valid_area_km2(raster: &Raster) -> f64 {
    let (pw, ph) = raster.resolution();
    let pixel_m2 = if raster.crs().is_geographic() {
        let lat = raster.bounds().center().1.to_radians();
        (pw * METERS_PER_DEGREE * lat.cos()) * (ph * METERS_PER_DEGREE)
    } else {
        pw * ph
    };
    raster.valid_count() as f64 * pixel_m2 / 1e6
}

/// Summarise the clipped elevation and, when available, slope and aspect.
pub fn compute_statistics(
    elevation: &Raster,
    slope: Option<&Raster>,
    aspect: Option<&Raster>,
) -> Result<TerrainStatistics> {
    let (min, max, mean, std) = summarize(valid(elevation)).ok_or(AnalysisError::NoValidPixels)?;
    let slope = slope
        .and_then(|r| summarize(valid(r)))
        .map(|(min, max, mean, std)| SlopeStats {
            mean,
            min,
            max,
            std,
        });
    let aspect = aspect
        .and_then(|r| circular_mean_deg(r.valid_values(0).map(f64::from)))
        .map(|mean_deg| AspectStats {
            mean_deg,
            direction: compass_direction(mean_deg).to_string(),
        });

    Ok(TerrainStatistics {
        elevation: ElevationStats {
            min,
            max,
            mean,
            std,
            relief: max - min,
            ruggedness: std,
        },
        slope,
        aspect,
        pixel_count: elevation.valid_count(),
        area_km2: valid_area_km2(elevation),
        bounds: elevation.bounds(),
        processed_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use terrasight_dem::{Crs, GeoTransform};

    fn raster(values: Vec<f32>, crs: Crs, step: f64) -> Raster {
        let n = values.len();
        Raster::new(n, 1, GeoTransform::new(0.0, step, step, step), crs, Some(-9999.0), vec![values]).unwrap()
    }

    #[test]
    fn test_elevation_stats_ignore_nodata() {
        let r = raster(vec![10.0, 20.0, -9999.0, 30.0], Crs::PT_TM06, 10.0);
        let stats = compute_statistics(&r, None, None).unwrap();
        assert_eq!(stats.pixel_count, 3);
        assert_relative_eq!(stats.elevation.min, 10.0);
        assert_relative_eq!(stats.elevation.max, 30.0);
        assert_relative_eq!(stats.elevation.mean, 20.0);
        assert_relative_eq!(stats.elevation.relief, 20.0);
        assert_relative_eq!(stats.elevation.std, 10.0, epsilon = 1e-9);
        assert_relative_eq!(stats.area_km2, 3.0 * 100.0 / 1e6);
        assert!(stats.slope.is_none());
        assert!(stats.aspect.is_none());
    }

    #[test]
    fn test_circular_aspect_mean_wraps() {
        let north = circular_mean_deg([350.0, 10.0]).unwrap();
        assert!(north < 1e-9 || north > 360.0 - 1e-9);
        assert_relative_eq!(circular_mean_deg([80.0, 100.0, -1.0]).unwrap(), 90.0, epsilon = 1e-9);
        assert!(circular_mean_deg([-1.0]).is_none());
        assert_eq!(compass_direction(0.0), "N");
        assert_eq!(compass_direction(359.0), "N");
        assert_eq!(compass_direction(135.0), "SE");
        assert_eq!(compass_direction(270.0), "W");
    }

    #[test]
    fn test_slope_and_aspect_included() {
        let dem = raster(vec![1.0, 2.0], Crs::WGS84, 0.001);
        let slope = raster(vec![4.0, 8.0], Crs::WGS84, 0.001);
        let aspect = raster(vec![170.0, 190.0], Crs::WGS84, 0.001);
        let stats = compute_statistics(&dem, Some(&slope), Some(&aspect)).unwrap();
        let s = stats.slope.unwrap();
        assert_relative_eq!(s.mean, 6.0);
        assert_relative_eq!(s.max, 8.0);
        let a = stats.aspect.unwrap();
        assert_relative_eq!(a.mean_deg, 180.0, epsilon = 1e-9);
        assert_eq!(a.direction, "S");
        // About 111 m x 111 m per pixel near the equator.
        assert_relative_eq!(stats.area_km2, 2.0 * 0.11132 * 0.11132, max_relative = 1e-3);
    }
}
