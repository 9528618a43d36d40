//! SRTM `.hgt` height files.
//!
//! An HGT file is a square grid of big-endian `i16` samples with no header.
//! Samples sit on whole arc-second intersections, so the outer row and
//! column duplicate the neighbouring tiles' edges and the pixel footprints
//! overhang the 1x1 degree cell by half a pixel on every side.

use crate::crs::Crs;
use crate::raster::{GeoTransform, Raster};
use crate::tile_index::grid::SrtmTile;
use crate::{DemError, Result};
use std::io::Read;
use std::path::Path;

/// Void marker used by SRTM.
pub const HGT_VOID: i16 = -32768;

/// Parse an in-memory HGT grid for `tile`.
pub fn decode_hgt(bytes: &[u8], tile: SrtmTile, label: &str) -> Result<Raster> {
    let samples = bytes.len() / 2;
    let side = (samples as f64).sqrt().round() as usize;
    if bytes.len() % 2 != 0 || side * side != samples || side < 2 {
        return Err(DemError::InvalidHgt {
            path: label.to_string(),
            reason: format!("{} bytes is not a square i16 grid", bytes.len()),
        });
    }

    let data: Vec<f32> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]) as f32)
        .collect();

    let step = 1.0 / (side - 1) as f64;
    let transform = GeoTransform::new(
        tile.lon as f64 - step / 2.0,
        tile.lat as f64 + 1.0 + step / 2.0,
        step,
        step,
    );
    Raster::new(side, side, transform, Crs::WGS84, Some(HGT_VOID as f32), vec![data])
}

/// Read an `.hgt` file; the tile is taken from the file name.
pub fn read_hgt<P: AsRef<Path>>(path: P) -> Result<Raster> {
    let path = path.as_ref();
    let tile = SrtmTile::from_path(path)?;
    let bytes = std::fs::read(path)?;
    decode_hgt(&bytes, tile, &path.display().to_string())
}

/// Pull the first `.hgt` member out of a zip archive.
pub fn extract_hgt_from_zip(zip_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(zip_bytes))?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.name().to_ascii_lowercase().ends_with(".hgt") {
            let mut buffer = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buffer)?;
            return Ok(buffer);
        }
    }
    Err(DemError::InvalidHgt {
        path: "<zip>".to_string(),
        reason: "archive contains no .hgt member".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn synthetic_hgt(side: usize, value: impl Fn(usize, usize) -> i16) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(side * side * 2);
        for row in 0..side {
            for col in 0..side {
                bytes.extend_from_slice(&value(row, col).to_be_bytes());
            }
        }
        bytes
    }

    #[test]
    fn test_decode_georeferencing() {
        let tile = SrtmTile::new(47, -123);
        let bytes = synthetic_hgt(11, |row, col| (row * 100 + col) as i16);
        let r = decode_hgt(&bytes, tile, "t").unwrap();
        let b = r.bounds();
        assert!((b.min_x - (-123.05)).abs() < 1e-9);
        assert!((b.max_x - (-121.95)).abs() < 1e-9);
        assert!((b.max_y - 48.05).abs() < 1e-9);
        assert!((b.min_y - 46.95).abs() < 1e-9);
        // North-west sample sits exactly on the corner.
        assert_eq!(r.sample_nearest(0, -123.0, 48.0), Some(0.0));
        assert_eq!(r.sample_nearest(0, -122.0, 47.0), Some(1010.0));
    }

    #[test]
    fn test_void_is_nodata() {
        let tile = SrtmTile::new(0, 0);
        let bytes = synthetic_hgt(3, |_, col| if col == 1 { HGT_VOID } else { 5 });
        let r = decode_hgt(&bytes, tile, "t").unwrap();
        assert_eq!(r.valid_count(), 6);
    }

    #[test]
    fn test_rejects_non_square() {
        let tile = SrtmTile::new(0, 0);
        assert!(matches!(
            decode_hgt(&[0u8; 10], tile, "bad"),
            Err(DemError::InvalidHgt { .. })
        ));
    }

    #[test]
    fn test_extract_from_zip() {
        let hgt = synthetic_hgt(3, |_, _| 7);
        let mut zip_bytes = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            writer
                .start_file("N00E000.hgt", zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(&hgt).unwrap();
            writer.finish().unwrap();
        }
        assert_eq!(extract_hgt_from_zip(&zip_bytes).unwrap(), hgt);
    }
}
