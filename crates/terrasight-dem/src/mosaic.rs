//! Mosaic, normalise and clip raw tiles into the clipped elevation artifact.
//!
//! Intermediate rasters are plain values: [`MosaicRaster`] and
//! [`NormalizedRaster`] are moved into the next step and consumed there,
//! so nothing transient outlives [`acquire`] on any return path.

use crate::crs::{normalize, Crs};
use crate::error::AcquisitionError;
use crate::geometry::AreaOfInterest;
use crate::raster::{GeoTransform, Raster};
use crate::tile_index::RawTile;
use crate::{NODATA, WORKING_CRS};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the clipped elevation inside a session directory.
pub const CLIPPED_DEM_FILE: &str = "clipped_dem.tif";

/// Largest composite grid [`mosaic`] will allocate, 1 GiB of `f32`.
pub const MAX_MOSAIC_CELLS: usize = 1 << 28;

type AcqResult<T> = std::result::Result<T, AcquisitionError>;

/// Composite of one or more same-CRS tiles.
#[derive(Debug)]
pub struct MosaicRaster(Raster);

/// A raster known to be in the working CRS.
#[derive(Debug)]
pub struct NormalizedRaster(Raster);

impl MosaicRaster {
    pub fn crs(&self) -> Crs {
        self.0.crs()
    }

    /// Reproject into the working CRS, consuming the mosaic.
    pub fn normalize(self) -> AcqResult<NormalizedRaster> {
        NormalizedRaster::new(self.0)
    }
}

impl NormalizedRaster {
    pub fn new(raster: Raster) -> AcqResult<Self> {
        Ok(Self(normalize(raster, WORKING_CRS)?))
    }

    pub fn raster(&self) -> &Raster {
        &self.0
    }
}

/// Clipped single-band elevation in the working CRS.
#[derive(Debug)]
pub struct ClippedElevation {
    pub path: PathBuf,
    pub raster: Raster,
}

/// Composite same-CRS rasters onto the union extent at the finest input
/// resolution. Earlier inputs take precedence: a cell keeps the first
/// valid value any input offers.
///
/// Fails with [`AcquisitionError::TooLarge`] before allocating when the
/// grid would exceed [`MAX_MOSAIC_CELLS`].
pub fn mosaic(rasters: Vec<Raster>) -> AcqResult<MosaicRaster> {
    let mut iter = rasters.into_iter();
    let first = iter.next().ok_or(AcquisitionError::AllTilesUnreadable {
        count: 0,
        reason: "nothing to mosaic".to_string(),
    })?;
    let rest: Vec<Raster> = iter.collect();
    if rest.is_empty() {
        return Ok(MosaicRaster(first));
    }

    let crs = first.crs();
    if let Some(other) = rest.iter().find(|r| r.crs() != crs) {
        return Err(AcquisitionError::CrsMismatch {
            expected: crs,
            found: other.crs(),
        });
    }

    let inputs: Vec<Raster> = std::iter::once(first).chain(rest).collect();
    let bounds = inputs
        .iter()
        .skip(1)
        .fold(inputs[0].bounds(), |acc, r| acc.union(&r.bounds()));
    let pixel_width = inputs
        .iter()
        .map(|r| r.resolution().0)
        .fold(f64::INFINITY, f64::min);
    let pixel_height = inputs
        .iter()
        .map(|r| r.resolution().1)
        .fold(f64::INFINITY, f64::min);

    // Round before ceil so float noise on exact multiples adds no column.
    let columns = ((bounds.width() / pixel_width * 1e6).round() / 1e6).ceil();
    let rows = ((bounds.height() / pixel_height * 1e6).round() / 1e6).ceil();
    let cells = columns * rows;
    if !(cells <= MAX_MOSAIC_CELLS as f64) {
        return Err(AcquisitionError::TooLarge {
            cells,
            limit: MAX_MOSAIC_CELLS,
        });
    }
    let (width, height) = (columns as usize, rows as usize);
    let transform = GeoTransform::new(bounds.min_x, bounds.max_y, pixel_width, pixel_height);
    debug!(inputs = inputs.len(), width, height, crs = %crs, "mosaicking");

    let mut data = vec![NODATA; width * height];
    data.par_chunks_mut(width).enumerate().for_each(|(row, out)| {
        for (col, cell) in out.iter_mut().enumerate() {
            let (x, y) = transform.pixel_center(col, row);
            if let Some(v) = inputs.iter().find_map(|r| r.sample_nearest(0, x, y)) {
                *cell = v;
            }
        }
    });

    Ok(MosaicRaster(Raster::new(
        width,
        height,
        transform,
        crs,
        Some(NODATA),
        vec![data],
    )?))
}

/// Crop to the AOI bounding box and set every pixel outside the polygon to
/// nodata.
///
/// The polygon is grown by `buffer_pixels` source pixels so cells whose
/// centre sits on the boundary are kept. The crop window is the buffered
/// AOI box snapped outward to the pixel grid.
pub fn clip(
    normalized: NormalizedRaster,
    aoi: &AreaOfInterest,
    buffer_pixels: f64,
) -> AcqResult<Raster> {
    let src = normalized.0;
    if src.crs() != WORKING_CRS {
        return Err(AcquisitionError::CrsMismatch {
            expected: WORKING_CRS,
            found: src.crs(),
        });
    }
    let (pw, ph) = src.resolution();
    let buffer = buffer_pixels.max(0.0) * pw.max(ph);
    let window = aoi.bbox().buffered(buffer);
    let t = *src.transform();

    let col0 = ((window.min_x - t.origin_x) / pw).floor().max(0.0) as usize;
    let col1 = (((window.max_x - t.origin_x) / pw).ceil().max(0.0) as usize).min(src.width());
    let row0 = ((t.origin_y - window.max_y) / ph).floor().max(0.0) as usize;
    let row1 = (((t.origin_y - window.min_y) / ph).ceil().max(0.0) as usize).min(src.height());
    if col0 >= col1 || row0 >= row1 {
        return Err(AcquisitionError::EmptyClip);
    }

    let (width, height) = (col1 - col0, row1 - row0);
    let transform = GeoTransform::new(
        t.origin_x + col0 as f64 * pw,
        t.origin_y - row0 as f64 * ph,
        pw,
        ph,
    );
    let footprint = aoi.footprint();

    let mut data = vec![NODATA; width * height];
    data.par_chunks_mut(width).enumerate().for_each(|(row, out)| {
        for (col, cell) in out.iter_mut().enumerate() {
            let (x, y) = transform.pixel_center(col, row);
            if !footprint.contains_or_near(x, y, buffer) {
                continue;
            }
            if let Some(v) = src.get(0, col0 + col, row0 + row) {
                *cell = v;
            }
        }
    });

    let clipped = Raster::new(width, height, transform, src.crs(), Some(NODATA), vec![data])?;
    if clipped.valid_count() == 0 {
        return Err(AcquisitionError::EmptyClip);
    }
    debug!(width, height, valid = clipped.valid_count(), "clipped to AOI");
    Ok(clipped)
}

/// Stage boundaries reported by [`acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionStage {
    TilesLoaded { count: usize },
    Mosaicked,
    Normalized,
    Clipped,
}

/// Turn resolved tiles into the clipped elevation written under `session_dir`.
///
/// Tiles that fail to decode are skipped with a warning; the step fails only
/// when none can be read. When every tile shares one CRS the mosaic is built
/// natively and reprojected once; mixed-CRS tiles are normalised one by one
/// and then mosaicked.
pub fn acquire<F>(
    tiles: &[RawTile],
    aoi: &AreaOfInterest,
    source_id: &str,
    buffer_pixels: f64,
    session_dir: &Path,
    mut on_stage: F,
) -> AcqResult<ClippedElevation>
where
    F: FnMut(AcquisitionStage),
{
    if tiles.is_empty() {
        return Err(AcquisitionError::NoTiles {
            source_id: source_id.to_string(),
        });
    }

    let mut by_crs: BTreeMap<Crs, Vec<Raster>> = BTreeMap::new();
    let mut last_error = String::new();
    let mut loaded = 0;
    for tile in tiles {
        match tile.load() {
            Ok(raster) => {
                loaded += 1;
                by_crs.entry(raster.crs()).or_default().push(raster);
            }
            Err(e) => {
                warn!(path = %tile.path.display(), error = %e, "skipping unreadable tile");
                last_error = e.to_string();
            }
        }
    }
    if loaded == 0 {
        return Err(AcquisitionError::AllTilesUnreadable {
            count: tiles.len(),
            reason: last_error,
        });
    }
    on_stage(AcquisitionStage::TilesLoaded { count: loaded });

    let normalized = if by_crs.len() == 1 {
        let rasters = by_crs.into_values().flatten().collect();
        let mosaicked = mosaic(rasters)?;
        on_stage(AcquisitionStage::Mosaicked);
        let normalized = mosaicked.normalize()?;
        on_stage(AcquisitionStage::Normalized);
        normalized
    } else {
        info!(crs_groups = by_crs.len(), "tiles span several CRSs, normalising each");
        let rasters = by_crs
            .into_values()
            .flatten()
            .map(|r| normalize(r, WORKING_CRS))
            .collect::<crate::Result<Vec<_>>>()?;
        on_stage(AcquisitionStage::Normalized);
        let mosaicked = mosaic(rasters)?;
        on_stage(AcquisitionStage::Mosaicked);
        NormalizedRaster(mosaicked.0)
    };

    let raster = clip(normalized, aoi, buffer_pixels)?;
    let path = session_dir.join(CLIPPED_DEM_FILE);
    raster.write_geotiff(&path)?;
    on_stage(AcquisitionStage::Clipped);
    info!(
        aoi = aoi.id(),
        path = %path.display(),
        width = raster.width(),
        height = raster.height(),
        "wrote clipped elevation"
    );
    Ok(ClippedElevation { path, raster })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BoundingBox;

    fn grid(origin: (f64, f64), size: usize, step: f64, value: impl Fn(usize, usize) -> f32) -> Raster {
        let data = (0..size * size).map(|i| value(i % size, i / size)).collect();
        Raster::new(
            size,
            size,
            GeoTransform::new(origin.0, origin.1, step, step),
            Crs::WGS84,
            Some(NODATA),
            vec![data],
        )
        .unwrap()
    }

    #[test]
    fn test_single_input_skips_compositing() {
        let r = grid((0.0, 1.0), 4, 0.25, |c, _| c as f32);
        let m = mosaic(vec![r.clone()]).unwrap();
        assert_eq!(m.0.band(0), r.band(0));
        assert_eq!(m.0.bounds(), r.bounds());
    }

    #[test]
    fn test_first_valid_wins() {
        // Two overlapping rasters; the first has a hole at (0, 0).
        let a = grid((0.0, 1.0), 4, 0.25, |c, r| if c == 0 && r == 0 { NODATA } else { 1.0 });
        let b = grid((0.0, 1.0), 4, 0.25, |_, _| 2.0);
        let m = mosaic(vec![a, b]).unwrap().0;
        assert_eq!(m.get(0, 0, 0), Some(2.0));
        assert!(m.valid_values(0).skip(1).all(|v| v == 1.0));
    }

    #[test]
    fn test_mosaic_union_and_finest_resolution() {
        let coarse = grid((0.0, 1.0), 2, 0.5, |_, _| 1.0);
        let fine = grid((1.0, 1.0), 4, 0.25, |_, _| 2.0);
        let m = mosaic(vec![coarse, fine]).unwrap().0;
        assert_eq!(m.resolution(), (0.25, 0.25));
        assert_eq!((m.width(), m.height()), (8, 4));
        assert_eq!(m.bounds(), BoundingBox::new(0.0, 0.0, 2.0, 1.0));
        assert_eq!(m.valid_count(), 32);
    }

    #[test]
    fn test_mosaic_over_budget_fails_without_allocating() {
        // A 1 degree tile next to a sub-metre one would need ~1e12 cells.
        let coarse = grid((0.0, 1.0), 2, 0.5, |_, _| 1.0);
        let fine = grid((0.5, 1.0), 2, 1e-6, |_, _| 2.0);
        match mosaic(vec![coarse, fine]) {
            Err(AcquisitionError::TooLarge { cells, limit }) => {
                assert_eq!(limit, MAX_MOSAIC_CELLS);
                assert!(cells > 1e11, "{}", cells);
            }
            other => panic!("expected TooLarge, got {:?}", other.map(|m| m.crs())),
        }
    }

    #[test]
    fn test_mosaic_rejects_mixed_crs() {
        let a = grid((0.0, 1.0), 2, 0.5, |_, _| 1.0);
        let b = Raster::new(
            2,
            2,
            GeoTransform::new(0.0, 1.0, 0.5, 0.5),
            Crs::PT_TM06,
            None,
            vec![vec![1.0; 4]],
        )
        .unwrap();
        assert!(matches!(
            mosaic(vec![a, b]),
            Err(AcquisitionError::CrsMismatch { .. })
        ));
    }

    #[test]
    fn test_clip_masks_outside_polygon_and_crops() {
        let r = grid((0.0, 1.0), 10, 0.1, |_, _| 5.0);
        let triangle = r#"{"type":"Polygon","coordinates":[[[0.2,0.2],[0.8,0.2],[0.2,0.8],[0.2,0.2]]]}"#;
        let aoi = AreaOfInterest::from_geojson("tri", triangle).unwrap();
        let clipped = clip(NormalizedRaster(r), &aoi, 0.5).unwrap();

        let b = clipped.bounds();
        assert!(b.contains_box(&aoi.bbox(), 1e-9));
        assert!(aoi.bbox().buffered(0.1 + 0.05 + 1e-9).contains_box(&b, 0.0));

        // Inside the triangle near its right angle: valid.
        assert_eq!(clipped.sample_nearest(0, 0.25, 0.25), Some(5.0));
        // Inside the bbox but well outside the hypotenuse: masked.
        assert_eq!(clipped.sample_nearest(0, 0.75, 0.75), None);
    }

    #[test]
    fn test_clip_without_overlap_is_empty() {
        let r = grid((0.0, 1.0), 10, 0.1, |_, _| 5.0);
        let aoi = AreaOfInterest::from_bbox("away", BoundingBox::new(5.0, 5.0, 6.0, 6.0)).unwrap();
        assert!(matches!(
            clip(NormalizedRaster(r), &aoi, 0.5),
            Err(AcquisitionError::EmptyClip)
        ));
    }

    #[test]
    fn test_acquire_with_no_tiles_fails_before_mosaic() {
        let dir = tempfile::tempdir().unwrap();
        let aoi = AreaOfInterest::from_bbox("a", BoundingBox::new(0.0, 0.0, 1.0, 1.0)).unwrap();
        let mut stages = Vec::new();
        let err = acquire(&[], &aoi, "srtm", 0.5, dir.path(), |s| stages.push(s)).unwrap_err();
        assert!(matches!(err, AcquisitionError::NoTiles { .. }));
        assert!(stages.is_empty());
        assert!(!dir.path().join(CLIPPED_DEM_FILE).exists());
    }
}
