//! Georeferenced raster model and GeoTIFF I/O.

use crate::cache::write_atomic;
use crate::crs::Crs;
use crate::geometry::BoundingBox;
use crate::{DemError, Result};
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tracing::debug;

const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

const KEY_MODEL_TYPE: u16 = 1024;
const KEY_RASTER_TYPE: u16 = 1025;
const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_CS_TYPE: u16 = 3072;

/// Affine placement of a north-up grid: the north-west corner of pixel
/// (0, 0) plus positive pixel sizes. Rows run north to south.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    /// X coordinate of the west edge.
    pub origin_x: f64,
    /// Y coordinate of the north edge.
    pub origin_y: f64,
    /// Pixel width in CRS units.
    pub pixel_width: f64,
    /// Pixel height in CRS units (positive; y decreases with row).
    pub pixel_height: f64,
}

impl GeoTransform {
    pub const fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        }
    }

    /// World coordinates of a pixel centre.
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y - (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Fractional pixel coordinates (column, row) of a world point, measured
    /// from the grid's north-west corner.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.origin_x) / self.pixel_width,
            (self.origin_y - y) / self.pixel_height,
        )
    }
}

/// A multi-band `f32` raster with CRS and nodata metadata.
#[derive(Debug, Clone)]
pub struct Raster {
    width: usize,
    height: usize,
    transform: GeoTransform,
    crs: Crs,
    nodata: Option<f32>,
    /// One row-major buffer per band.
    bands: Vec<Vec<f32>>,
}

impl Raster {
    /// Build a raster, checking that every band matches the grid size.
    pub fn new(
        width: usize,
        height: usize,
        transform: GeoTransform,
        crs: Crs,
        nodata: Option<f32>,
        bands: Vec<Vec<f32>>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(DemError::InvalidRaster(format!(
                "empty grid {}x{}",
                width, height
            )));
        }
        if bands.is_empty() {
            return Err(DemError::InvalidRaster("raster has no bands".to_string()));
        }
        if let Some(bad) = bands.iter().position(|b| b.len() != width * height) {
            return Err(DemError::InvalidRaster(format!(
                "band {} has {} samples, expected {}",
                bad,
                bands[bad].len(),
                width * height
            )));
        }
        if !(transform.pixel_width > 0.0 && transform.pixel_height > 0.0) {
            return Err(DemError::InvalidRaster(
                "pixel size must be positive".to_string(),
            ));
        }
        Ok(Self {
            width,
            height,
            transform,
            crs,
            nodata,
            bands,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn crs(&self) -> Crs {
        self.crs
    }

    pub fn nodata(&self) -> Option<f32> {
        self.nodata
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn band(&self, index: usize) -> &[f32] {
        &self.bands[index]
    }

    pub fn into_bands(self) -> Vec<Vec<f32>> {
        self.bands
    }

    /// Pixel size as (x, y) in CRS units.
    pub fn resolution(&self) -> (f64, f64) {
        (self.transform.pixel_width, self.transform.pixel_height)
    }

    /// Outer edges of the grid.
    pub fn bounds(&self) -> BoundingBox {
        let t = &self.transform;
        BoundingBox::new(
            t.origin_x,
            t.origin_y - self.height as f64 * t.pixel_height,
            t.origin_x + self.width as f64 * t.pixel_width,
            t.origin_y,
        )
    }

    /// True for NaN or values within 0.001 of the nodata sentinel.
    pub fn is_nodata(&self, value: f32) -> bool {
        value.is_nan() || self.nodata.is_some_and(|nd| (value - nd).abs() < 0.001)
    }

    /// Value at a pixel, `None` if nodata.
    pub fn get(&self, band: usize, col: usize, row: usize) -> Option<f32> {
        let v = self.bands[band][row * self.width + col];
        (!self.is_nodata(v)).then_some(v)
    }

    /// Value of the pixel containing the world point, `None` if outside the
    /// grid or nodata.
    pub fn sample_nearest(&self, band: usize, x: f64, y: f64) -> Option<f32> {
        let (px, py) = self.transform.world_to_pixel(x, y);
        if px < 0.0 || py < 0.0 {
            return None;
        }
        let (col, row) = (px.floor() as usize, py.floor() as usize);
        if col >= self.width || row >= self.height {
            return None;
        }
        self.get(band, col, row)
    }

    /// Bilinear interpolation between the four surrounding pixel centres.
    ///
    /// Nodata neighbours are dropped and the remaining weights renormalised,
    /// so an isolated hole does not bleed into its neighbourhood. Returns
    /// `None` outside the grid or when every neighbour is nodata.
    pub fn sample_bilinear(&self, band: usize, x: f64, y: f64) -> Option<f32> {
        let (px, py) = self.transform.world_to_pixel(x, y);
        if px < 0.0 || py < 0.0 || px > self.width as f64 || py > self.height as f64 {
            return None;
        }
        // Shift to pixel-centre coordinates.
        let fx = px - 0.5;
        let fy = py - 0.5;
        let x0 = fx.floor();
        let y0 = fy.floor();
        let tx = fx - x0;
        let ty = fy - y0;

        let mut sum = 0.0f64;
        let mut weight = 0.0f64;
        for (dx, dy, w) in [
            (0, 0, (1.0 - tx) * (1.0 - ty)),
            (1, 0, tx * (1.0 - ty)),
            (0, 1, (1.0 - tx) * ty),
            (1, 1, tx * ty),
        ] {
            if w <= 0.0 {
                continue;
            }
            let c = x0 as i64 + dx;
            let r = y0 as i64 + dy;
            if c < 0 || r < 0 || c >= self.width as i64 || r >= self.height as i64 {
                continue;
            }
            if let Some(v) = self.get(band, c as usize, r as usize) {
                sum += v as f64 * w;
                weight += w;
            }
        }
        (weight > 0.0).then(|| (sum / weight) as f32)
    }

    /// Number of non-nodata pixels in band 0.
    pub fn valid_count(&self) -> usize {
        self.bands[0].iter().filter(|v| !self.is_nodata(**v)).count()
    }

    /// Valid values of a band.
    pub fn valid_values(&self, band: usize) -> impl Iterator<Item = f32> + '_ {
        self.bands[band]
            .iter()
            .copied()
            .filter(move |v| !self.is_nodata(*v))
    }

    /// Load a GeoTIFF. `default_crs` is used when the file carries no
    /// GeoKeyDirectory.
    pub fn from_geotiff<P: AsRef<Path>>(path: P, default_crs: Crs) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let mut decoder = open_decoder(std::io::BufReader::new(file))?;
        let header = GeoTiffHeader::from_decoder(&mut decoder, default_crs)?;
        let data = decode_samples(&mut decoder)?;
        debug!(path = %path.display(), width = header.width, height = header.height, crs = %header.crs, "loaded GeoTIFF");
        header.into_raster(data)
    }

    /// Write band 0 as a single-band float GeoTIFF via temp file and rename.
    pub fn write_geotiff<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if self.bands.len() != 1 {
            return Err(DemError::InvalidRaster(format!(
                "GeoTIFF output is single-band, raster has {} bands",
                self.bands.len()
            )));
        }
        let bytes = self.encode_geotiff()?;
        write_atomic(path.as_ref(), &bytes)?;
        Ok(())
    }

    fn encode_geotiff(&self) -> Result<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut buffer)?;
            let mut image =
                encoder.new_image::<colortype::Gray32Float>(self.width as u32, self.height as u32)?;
            let t = &self.transform;
            let dir = image.encoder();
            dir.write_tag(
                Tag::from_u16_exhaustive(TAG_MODEL_PIXEL_SCALE),
                &[t.pixel_width, t.pixel_height, 0.0][..],
            )?;
            dir.write_tag(
                Tag::from_u16_exhaustive(TAG_MODEL_TIEPOINT),
                &[0.0, 0.0, 0.0, t.origin_x, t.origin_y, 0.0][..],
            )?;
            dir.write_tag(Tag::from_u16_exhaustive(TAG_GEO_KEY_DIRECTORY), &geo_keys(self.crs)[..])?;
            if let Some(nodata) = self.nodata {
                dir.write_tag(Tag::from_u16_exhaustive(TAG_GDAL_NODATA), nodata.to_string().as_str())?;
            }
            image.write_data(&self.bands[0])?;
        }
        Ok(buffer.into_inner())
    }
}

/// Georeferencing read from a GeoTIFF without decoding pixels.
#[derive(Debug, Clone)]
pub struct GeoTiffHeader {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub crs: Crs,
    pub nodata: Option<f32>,
}

impl GeoTiffHeader {
    /// Read only the first IFD of a GeoTIFF file.
    pub fn read<P: AsRef<Path>>(path: P, default_crs: Crs) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let mut decoder = open_decoder(std::io::BufReader::new(file))?;
        Self::from_decoder(&mut decoder, default_crs)
    }

    pub fn bounds(&self) -> BoundingBox {
        let t = &self.transform;
        BoundingBox::new(
            t.origin_x,
            t.origin_y - self.height as f64 * t.pixel_height,
            t.origin_x + self.width as f64 * t.pixel_width,
            t.origin_y,
        )
    }

    fn from_decoder<R: Read + Seek>(decoder: &mut Decoder<R>, default_crs: Crs) -> Result<Self> {
        let (width, height) = decoder.dimensions()?;

        let tiepoint = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(TAG_MODEL_TIEPOINT));
        let scale = decoder.get_tag_f64_vec(Tag::from_u16_exhaustive(TAG_MODEL_PIXEL_SCALE));
        let transform = match (tiepoint, scale) {
            (Ok(tp), Ok(sc)) if tp.len() >= 6 && sc.len() >= 2 => {
                // Tiepoint is [i, j, k, x, y, z]; shift back to pixel (0, 0).
                GeoTransform::new(
                    tp[3] - tp[0] * sc[0],
                    tp[4] + tp[1] * sc[1],
                    sc[0],
                    sc[1],
                )
            }
            _ => {
                return Err(DemError::InvalidGeoTiff(
                    "missing ModelTiepoint/ModelPixelScale".to_string(),
                ))
            }
        };

        let crs = decoder
            .get_tag_u16_vec(Tag::from_u16_exhaustive(TAG_GEO_KEY_DIRECTORY))
            .ok()
            .and_then(|keys| crs_from_geo_keys(&keys))
            .unwrap_or(default_crs);

        let nodata = decoder
            .get_tag_ascii_string(Tag::from_u16_exhaustive(TAG_GDAL_NODATA))
            .ok()
            .and_then(|s| s.trim().trim_end_matches('\0').parse::<f32>().ok());

        Ok(Self {
            width: width as usize,
            height: height as usize,
            transform,
            crs,
            nodata,
        })
    }

    fn into_raster(self, data: Vec<f32>) -> Result<Raster> {
        Raster::new(
            self.width,
            self.height,
            self.transform,
            self.crs,
            self.nodata,
            vec![data],
        )
    }
}

fn open_decoder<R: Read + Seek>(reader: R) -> Result<Decoder<R>> {
    // Archive tiles can be large; a 10k x 10k float tile is ~400 MB.
    let mut limits = Limits::default();
    limits.decoding_buffer_size = 1024 * 1024 * 1024;
    limits.intermediate_buffer_size = 1024 * 1024 * 1024;
    limits.ifd_value_size = 1024 * 1024 * 1024;
    Ok(Decoder::new(reader)?.with_limits(limits))
}

fn decode_samples<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Vec<f32>> {
    Ok(match decoder.read_image()? {
        DecodingResult::F32(data) => data,
        DecodingResult::F64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I16(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U16(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U8(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f32).collect(),
    })
}

/// Minimal GeoKeyDirectory: model type, pixel-is-area, and the EPSG code.
fn geo_keys(crs: Crs) -> Vec<u16> {
    let (model_type, crs_key) = if crs.is_geographic() {
        (2, KEY_GEOGRAPHIC_TYPE)
    } else {
        (1, KEY_PROJECTED_CS_TYPE)
    };
    vec![
        1, 1, 0, 3, // header: version, revision, minor, key count
        KEY_MODEL_TYPE, 0, 1, model_type,
        KEY_RASTER_TYPE, 0, 1, 1,
        crs_key, 0, 1, crs.epsg() as u16,
    ]
}

fn crs_from_geo_keys(keys: &[u16]) -> Option<Crs> {
    if keys.len() < 4 {
        return None;
    }
    let count = keys[3] as usize;
    let mut geographic = None;
    let mut projected = None;
    for entry in keys[4..].chunks_exact(4).take(count) {
        // Only inline (location 0) SHORT values carry an EPSG code directly.
        if entry[1] != 0 {
            continue;
        }
        match entry[0] {
            KEY_GEOGRAPHIC_TYPE => geographic = Some(entry[3]),
            KEY_PROJECTED_CS_TYPE => projected = Some(entry[3]),
            _ => {}
        }
    }
    // 32767 is "user-defined".
    projected
        .filter(|c| *c != 32767)
        .or(geographic.filter(|c| *c != 32767))
        .map(|c| Crs::from_epsg(c as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: usize, height: usize) -> Raster {
        let data = (0..width * height).map(|i| i as f32).collect();
        Raster::new(
            width,
            height,
            GeoTransform::new(10.0, 50.0, 0.25, 0.25),
            Crs::WGS84,
            Some(-9999.0),
            vec![data],
        )
        .unwrap()
    }

    #[test]
    fn test_bounds_and_pixel_center() {
        let r = ramp(4, 2);
        assert_eq!(r.bounds(), BoundingBox::new(10.0, 49.5, 11.0, 50.0));
        assert_eq!(r.transform().pixel_center(0, 0), (10.125, 49.875));
        assert_eq!(r.transform().pixel_center(3, 1), (10.875, 49.625));
    }

    #[test]
    fn test_new_rejects_band_size_mismatch() {
        let err = Raster::new(
            3,
            3,
            GeoTransform::new(0.0, 0.0, 1.0, 1.0),
            Crs::WGS84,
            None,
            vec![vec![0.0; 8]],
        );
        assert!(matches!(err, Err(DemError::InvalidRaster(_))));
    }

    #[test]
    fn test_sample_nearest_and_bilinear() {
        let r = ramp(4, 2);
        assert_eq!(r.sample_nearest(0, 10.3, 49.9), Some(1.0));
        assert_eq!(r.sample_nearest(0, 9.9, 49.9), None);
        // Exactly between pixel (0,0) and (1,0) centres.
        let v = r.sample_bilinear(0, 10.25, 49.875).unwrap();
        assert!((v - 0.5).abs() < 1e-6);
        // At a pixel centre the sample is the pixel value.
        let v = r.sample_bilinear(0, 10.625, 49.625).unwrap();
        assert!((v - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_bilinear_skips_nodata() {
        let r = Raster::new(
            2,
            1,
            GeoTransform::new(0.0, 1.0, 1.0, 1.0),
            Crs::WGS84,
            Some(-9999.0),
            vec![vec![10.0, -9999.0]],
        )
        .unwrap();
        // Halfway between a valid pixel and a hole: no blending with the sentinel.
        assert_eq!(r.sample_bilinear(0, 1.0, 0.5), Some(10.0));
        assert_eq!(r.valid_count(), 1);
    }

    #[test]
    fn test_geotiff_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.tif");
        let r = ramp(5, 3);
        r.write_geotiff(&path).unwrap();

        let header = GeoTiffHeader::read(&path, Crs::from_epsg(3857)).unwrap();
        assert_eq!(header.crs, Crs::WGS84);
        assert_eq!(header.nodata, Some(-9999.0));
        assert_eq!(header.bounds(), r.bounds());

        let back = Raster::from_geotiff(&path, Crs::from_epsg(3857)).unwrap();
        assert_eq!(back.band(0), r.band(0));
        assert_eq!(back.transform(), r.transform());
    }

    #[test]
    fn test_geotiff_projected_crs_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("utm.tif");
        let r = Raster::new(
            2,
            2,
            GeoTransform::new(500_000.0, 4_000_000.0, 1.0, 1.0),
            Crs::PT_TM06,
            None,
            vec![vec![1.0, 2.0, 3.0, 4.0]],
        )
        .unwrap();
        r.write_geotiff(&path).unwrap();
        let header = GeoTiffHeader::read(&path, Crs::WGS84).unwrap();
        assert_eq!(header.crs, Crs::PT_TM06);
        assert_eq!(header.nodata, None);
    }

    #[test]
    fn test_crs_from_geo_keys_user_defined() {
        let keys = [1, 1, 0, 1, KEY_PROJECTED_CS_TYPE, 0, 1, 32767];
        assert_eq!(crs_from_geo_keys(&keys), None);
    }
}
