//! Coordinate reference systems and the CRS normalizer.
//!
//! Projection math is delegated to `proj4rs`; this module owns the EPSG
//! table, the per-point transformer, and raster reprojection with bilinear
//! resampling.

use crate::geometry::{BoundingBox, Footprint};
use crate::raster::{GeoTransform, Raster};
use crate::{DemError, Result};
use proj4rs::proj::Proj;
use proj4rs::transform::transform;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// EPSG-coded coordinate reference system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Crs(u32);

impl Crs {
    /// WGS84 geographic lon/lat, the pipeline's working CRS.
    pub const WGS84: Crs = Crs(4326);
    /// NAD83 geographic, used by 3DEP products.
    pub const NAD83: Crs = Crs(4269);
    /// Web Mercator.
    pub const WEB_MERCATOR: Crs = Crs(3857);
    /// ETRS89 / Portugal TM06, the national LiDAR archive's native grid.
    pub const PT_TM06: Crs = Crs(3763);

    pub const fn from_epsg(code: u32) -> Self {
        Crs(code)
    }

    pub const fn epsg(&self) -> u32 {
        self.0
    }

    /// True for lon/lat systems measured in degrees.
    pub fn is_geographic(&self) -> bool {
        matches!(self.0, 4326 | 4269 | 4258 | 4979)
    }

    /// PROJ.4 definition string, if this CRS is known.
    pub fn proj_string(&self) -> Option<String> {
        let code = self.0;
        let s = match code {
            4326 | 4979 => "+proj=longlat +datum=WGS84 +no_defs".to_string(),
            4269 | 4258 => "+proj=longlat +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +no_defs".to_string(),
            3857 => "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
                .to_string(),
            3763 => "+proj=tmerc +lat_0=39.66825833333333 +lon_0=-8.133108333333334 +k=1 +x_0=0 +y_0=0 +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs"
                .to_string(),
            5070 => "+proj=aea +lat_0=23 +lon_0=-96 +lat_1=29.5 +lat_2=45.5 +x_0=0 +y_0=0 +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs"
                .to_string(),
            32601..=32660 => format!("+proj=utm +zone={} +datum=WGS84 +units=m +no_defs", code - 32600),
            32701..=32760 => {
                format!("+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs", code - 32700)
            }
            26901..=26923 => format!(
                "+proj=utm +zone={} +ellps=GRS80 +towgs84=0,0,0,0,0,0,0 +units=m +no_defs",
                code - 26900
            ),
            _ => return None,
        };
        Some(s)
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.0)
    }
}

/// Point transformer between two CRSs. Handles the degree/radian
/// conversion `proj4rs` expects for geographic systems.
pub struct CoordTransformer {
    source_proj: Proj,
    target_proj: Proj,
    source: Crs,
    target: Crs,
}

impl fmt::Debug for CoordTransformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordTransformer")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl CoordTransformer {
    pub fn new(source: Crs, target: Crs) -> Result<Self> {
        Ok(Self {
            source_proj: build_proj(source)?,
            target_proj: build_proj(target)?,
            source,
            target,
        })
    }

    pub fn source(&self) -> Crs {
        self.source
    }

    pub fn target(&self) -> Crs {
        self.target
    }

    /// Transform one point.
    pub fn transform(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        let mut point = if self.source.is_geographic() {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(&self.source_proj, &self.target_proj, &mut point).map_err(|e| {
            DemError::Reprojection {
                from: self.source,
                to: self.target,
                reason: format!("{:?}", e),
            }
        })?;
        let out = if self.target.is_geographic() {
            (point.0.to_degrees(), point.1.to_degrees())
        } else {
            (point.0, point.1)
        };
        if out.0.is_finite() && out.1.is_finite() {
            Ok(out)
        } else {
            Err(DemError::Reprojection {
                from: self.source,
                to: self.target,
                reason: format!("non-finite result for ({}, {})", x, y),
            })
        }
    }

    /// Envelope of `bbox` in the target CRS, sampled along every edge.
    pub fn transform_bounds(&self, bbox: &BoundingBox) -> Result<BoundingBox> {
        let points = bbox
            .edge_points(21)
            .into_iter()
            .map(|(x, y)| self.transform(x, y))
            .collect::<Result<Vec<_>>>()?;
        BoundingBox::from_points(points).ok_or_else(|| DemError::Reprojection {
            from: self.source,
            to: self.target,
            reason: "empty envelope".to_string(),
        })
    }

    /// Reproject every vertex of a footprint.
    pub fn transform_footprint(&self, footprint: &Footprint) -> Result<Footprint> {
        footprint.try_map(|x, y| self.transform(x, y))
    }
}

fn build_proj(crs: Crs) -> Result<Proj> {
    let def = crs.proj_string().ok_or(DemError::UnsupportedCrs(crs))?;
    Proj::from_proj_string(&def).map_err(|e| DemError::Reprojection {
        from: crs,
        to: crs,
        reason: format!("invalid projection definition: {:?}", e),
    })
}

/// Bring `raster` into `target`.
///
/// A raster already in `target` is returned as-is, so its data stays
/// bit-identical. Otherwise the destination grid covers the reprojected
/// envelope of the input with square pixels chosen to roughly preserve the
/// pixel count, and every band is resampled bilinearly.
pub fn normalize(raster: Raster, target: Crs) -> Result<Raster> {
    if raster.crs() == target {
        return Ok(raster);
    }
    reproject(&raster, target)
}

fn reproject(src: &Raster, target: Crs) -> Result<Raster> {
    let source = src.crs();
    let forward = CoordTransformer::new(source, target)?;
    // Surface an unusable inverse here; rows below rebuild it per thread.
    CoordTransformer::new(target, source)?;
    let envelope = forward.transform_bounds(&src.bounds())?;

    let pixel_count = (src.width() * src.height()).max(1) as f64;
    let pixel_size = (envelope.width() * envelope.height() / pixel_count).sqrt();
    if !(pixel_size.is_finite() && pixel_size > 0.0) {
        return Err(DemError::Reprojection {
            from: source,
            to: target,
            reason: "degenerate destination grid".to_string(),
        });
    }
    let width = ((envelope.width() / pixel_size).ceil() as usize).max(1);
    let height = ((envelope.height() / pixel_size).ceil() as usize).max(1);
    let dst_transform = GeoTransform::new(envelope.min_x, envelope.max_y, pixel_size, pixel_size);

    debug!(
        from = %source,
        to = %target,
        src_width = src.width(),
        src_height = src.height(),
        width,
        height,
        "reprojecting raster"
    );

    let nodata = src.nodata().unwrap_or(crate::NODATA);
    let mut bands = vec![vec![nodata; width * height]; src.band_count()];
    let warned = AtomicBool::new(false);

    for (band_index, band) in bands.iter_mut().enumerate() {
        band.par_chunks_mut(width).enumerate().for_each_init(
            || CoordTransformer::new(target, source),
            |inverse, (row, out)| {
                let inverse = match inverse {
                    Ok(inverse) => inverse,
                    Err(e) => {
                        if !warned.swap(true, Ordering::Relaxed) {
                            warn!(
                                from = %target,
                                to = %source,
                                error = %e,
                                row,
                                "inverse transform unavailable, rows left as nodata"
                            );
                        }
                        return;
                    }
                };
                for (col, cell) in out.iter_mut().enumerate() {
                    let (x, y) = dst_transform.pixel_center(col, row);
                    if let Ok((sx, sy)) = inverse.transform(x, y) {
                        if let Some(v) = src.sample_bilinear(band_index, sx, sy) {
                            *cell = v;
                        }
                    }
                }
            },
        );
    }

    Raster::new(width, height, dst_transform, target, Some(nodata), bands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_display_and_geographic() {
        assert_eq!(Crs::WGS84.to_string(), "EPSG:4326");
        assert!(Crs::WGS84.is_geographic());
        assert!(!Crs::PT_TM06.is_geographic());
        assert!(Crs::from_epsg(32633).proj_string().unwrap().contains("+zone=33"));
        assert!(Crs::from_epsg(32733).proj_string().unwrap().contains("+south"));
        assert!(Crs::from_epsg(99999).proj_string().is_none());
    }

    #[test]
    fn test_unsupported_crs() {
        assert!(matches!(
            CoordTransformer::new(Crs::from_epsg(99999), Crs::WGS84),
            Err(DemError::UnsupportedCrs(_))
        ));
    }

    #[test]
    fn test_reproject_with_unknown_crs_is_an_error() {
        let raster = Raster::new(
            2,
            2,
            GeoTransform::new(0.0, 2.0, 1.0, 1.0),
            Crs::from_epsg(99999),
            Some(-9999.0),
            vec![vec![1.0; 4]],
        )
        .unwrap();
        assert!(matches!(
            normalize(raster, Crs::WGS84),
            Err(DemError::UnsupportedCrs(crs)) if crs == Crs::from_epsg(99999)
        ));
    }

    #[test]
    fn test_round_trip_utm() {
        let fwd = CoordTransformer::new(Crs::WGS84, Crs::from_epsg(32610)).unwrap();
        let inv = CoordTransformer::new(Crs::from_epsg(32610), Crs::WGS84).unwrap();
        let (x, y) = fwd.transform(-122.4, 37.8).unwrap();
        assert!(x > 500_000.0 && x < 600_000.0, "easting {}", x);
        let (lon, lat) = inv.transform(x, y).unwrap();
        assert_relative_eq!(lon, -122.4, epsilon = 1e-7);
        assert_relative_eq!(lat, 37.8, epsilon = 1e-7);
    }

    #[test]
    fn test_normalize_same_crs_is_identity() {
        let data: Vec<f32> = (0..12).map(|v| v as f32 * 1.25).collect();
        let raster = Raster::new(
            4,
            3,
            GeoTransform::new(-10.0, 40.0, 0.5, 0.5),
            Crs::WGS84,
            Some(-9999.0),
            vec![data.clone()],
        )
        .unwrap();
        let out = normalize(raster, Crs::WGS84).unwrap();
        assert_eq!(out.band(0), data.as_slice());
        assert_eq!(out.transform(), &GeoTransform::new(-10.0, 40.0, 0.5, 0.5));
    }

    #[test]
    fn test_reproject_projected_to_geographic() {
        // A small planar ramp in PT-TM06 around the projection origin.
        let width = 40;
        let height = 40;
        let data: Vec<f32> = (0..width * height)
            .map(|i| 100.0 + (i % width) as f32)
            .collect();
        let raster = Raster::new(
            width,
            height,
            GeoTransform::new(-2000.0, 2000.0, 100.0, 100.0),
            Crs::PT_TM06,
            Some(-9999.0),
            vec![data],
        )
        .unwrap();
        let out = normalize(raster, Crs::WGS84).unwrap();
        assert_eq!(out.crs(), Crs::WGS84);
        let bounds = out.bounds();
        // The origin of PT-TM06 is at roughly 8.13W 39.67N.
        assert!(bounds.contains_point(-8.133, 39.668));
        assert!(out.valid_count() > (width * height) / 2);
        // The east-west ramp survives reprojection.
        let (cx, cy) = bounds.center();
        let west = out.sample_nearest(0, cx - bounds.width() / 4.0, cy).unwrap();
        let east = out.sample_nearest(0, cx + bounds.width() / 4.0, cy).unwrap();
        assert!(east > west);
    }
}
