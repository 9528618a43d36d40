//! Spatial-scan index over a large local archive of irregular GeoTIFF tiles.
//!
//! Tile names carry no location, so every file header is read once and the
//! resulting extents are cached in memory and in an optional JSON index
//! file. Queries test bounding boxes first and only run the exact polygon
//! test on the survivors.

use super::{RawTile, TileFormat, TileIndex, TileSet};
use crate::cache::write_atomic;
use crate::crs::{CoordTransformer, Crs};
use crate::geometry::{AreaOfInterest, BoundingBox, Footprint};
use crate::raster::GeoTiffHeader;
use crate::source::ElevationSource;
use crate::{Result, WORKING_CRS};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use terrasight_metrics::{metric_defs, PipelineLabels};
use tracing::{debug, info, warn};

/// Archive index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveOptions {
    /// Root directory, scanned recursively for `.tif` / `.tiff`.
    pub archive_dir: PathBuf,
    /// CRS assumed for files without GeoKeys.
    pub epsg: u32,
    /// Persisted scan results. Reused when present, written after a scan.
    pub index_file: Option<PathBuf>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("data/lidar"),
            epsg: Crs::PT_TM06.epsg(),
            index_file: None,
        }
    }
}

/// Extent of one archive file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub bounds: BoundingBox,
    pub crs: Crs,
    pub resolution: (f64, f64),
}

impl ArchiveEntry {
    fn to_raw_tile(&self) -> RawTile {
        RawTile {
            path: self.path.clone(),
            crs: self.crs,
            bounds: self.bounds,
            resolution: self.resolution,
            format: TileFormat::GeoTiff,
        }
    }
}

pub struct ArchiveIndex {
    options: ArchiveOptions,
    entries: Mutex<Option<Arc<Vec<ArchiveEntry>>>>,
}

impl ArchiveIndex {
    pub fn new(options: ArchiveOptions) -> Self {
        Self {
            options,
            entries: Mutex::new(None),
        }
    }

    /// All archive entries, scanning on first use.
    ///
    /// The lock is held across the scan so concurrent first queries share a
    /// single pass over the archive.
    pub fn entries(&self) -> Result<Arc<Vec<ArchiveEntry>>> {
        let mut guard = self.entries.lock();
        if let Some(entries) = guard.as_ref() {
            return Ok(Arc::clone(entries));
        }
        let entries = Arc::new(self.load_or_scan()?);
        *guard = Some(Arc::clone(&entries));
        Ok(entries)
    }

    /// Drop the cached scan; the next query rescans the directory.
    pub fn invalidate(&self) {
        *self.entries.lock() = None;
    }

    fn load_or_scan(&self) -> Result<Vec<ArchiveEntry>> {
        if let Some(index_file) = &self.options.index_file {
            if index_file.exists() {
                let entries: Vec<ArchiveEntry> =
                    serde_json::from_slice(&std::fs::read(index_file)?)?;
                info!(path = %index_file.display(), entries = entries.len(), "loaded archive index");
                return Ok(entries);
            }
        }

        let entries = scan_archive(&self.options.archive_dir, Crs::from_epsg(self.options.epsg))?;
        if let Some(index_file) = &self.options.index_file {
            write_atomic(index_file, &serde_json::to_vec_pretty(&entries)?)?;
            debug!(path = %index_file.display(), "wrote archive index");
        }
        Ok(entries)
    }
}

/// Read the header of every GeoTIFF under `root`. Unreadable files are
/// logged and skipped; an absent directory yields no entries.
pub fn scan_archive(root: &Path, default_crs: Crs) -> Result<Vec<ArchiveEntry>> {
    let mut files = Vec::new();
    if root.is_dir() {
        collect_tiffs(root, &mut files)?;
    } else {
        warn!(path = %root.display(), "archive directory does not exist");
    }

    let mut entries: Vec<ArchiveEntry> = files
        .par_iter()
        .filter_map(|path| match GeoTiffHeader::read(path, default_crs) {
            Ok(header) => Some(ArchiveEntry {
                path: path.clone(),
                bounds: header.bounds(),
                crs: header.crs,
                resolution: (header.transform.pixel_width, header.transform.pixel_height),
            }),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable archive file");
                None
            }
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    info!(root = %root.display(), files = files.len(), entries = entries.len(), "scanned archive");
    Ok(entries)
}

fn collect_tiffs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_tiffs(&path, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
        {
            out.push(path);
        }
    }
    Ok(())
}

impl TileIndex for ArchiveIndex {
    fn source(&self) -> ElevationSource {
        ElevationSource::LidarArchive
    }

    fn resolve(&self, aoi: &AreaOfInterest) -> Result<TileSet> {
        let entries = self.entries()?;
        let labels = PipelineLabels::new(ElevationSource::LidarArchive.id()).to_labels();

        // The AOI is expressed once per archive CRS.
        let mut footprints: HashMap<Crs, Footprint> = HashMap::new();
        let mut set = TileSet::default();
        let mut rejected = 0u64;

        for entry in entries.iter() {
            if !footprints.contains_key(&entry.crs) {
                let fp = if entry.crs == WORKING_CRS {
                    aoi.footprint().clone()
                } else {
                    CoordTransformer::new(WORKING_CRS, entry.crs)?
                        .transform_footprint(aoi.footprint())?
                };
                footprints.insert(entry.crs, fp);
            }
            let footprint = &footprints[&entry.crs];

            if !footprint.bbox().intersects(&entry.bounds) {
                continue;
            }
            if !footprint.intersects_bbox(&entry.bounds) {
                debug!(path = %entry.path.display(), "box overlaps but polygon misses tile");
                rejected += 1;
                continue;
            }
            set.tiles.push(entry.to_raw_tile());
        }

        if rejected > 0 {
            metrics::counter!(metric_defs::ARCHIVE_BBOX_REJECTED.name, labels.as_slice())
                .increment(rejected);
        }
        info!(
            aoi = aoi.id(),
            scanned = entries.len(),
            matched = set.tiles.len(),
            rejected,
            "resolved archive tiles"
        );
        Ok(set)
    }
}
