//! Masked PNG previews of derivative rasters.
//!
//! Colouring is a lookup: every value is mapped to an index into a small
//! palette, and the palette entry is copied out. Pixels outside the polygon
//! or on nodata are fully transparent.

use crate::error::{AnalysisError, Result};
use image::{Rgba, RgbaImage};
use rayon::prelude::*;
use std::path::Path;
use terrasight_dem::cache::write_atomic;
use terrasight_dem::{Footprint, Raster};

/// Colour for values below the elevation ramp.
const ELEVATION_LOW: [u8; 3] = [16, 105, 40];
/// Colour for values above the elevation ramp.
const ELEVATION_HIGH: [u8; 3] = [255, 255, 255];

const ELEVATION_RAMP: [[u8; 3]; 49] = [
    [12, 130, 44],
    [8, 155, 48],
    [5, 181, 51],
    [5, 199, 59],
    [14, 203, 75],
    [22, 208, 91],
    [33, 212, 104],
    [50, 215, 108],
    [68, 219, 111],
    [86, 222, 114],
    [103, 225, 118],
    [121, 228, 122],
    [139, 231, 125],
    [157, 234, 129],
    [176, 238, 134],
    [195, 242, 139],
    [215, 246, 144],
    [226, 245, 146],
    [232, 240, 147],
    [238, 235, 147],
    [245, 229, 148],
    [233, 216, 140],
    [221, 202, 132],
    [209, 188, 124],
    [196, 173, 116],
    [185, 157, 109],
    [173, 141, 101],
    [162, 125, 94],
    [156, 118, 91],
    [151, 110, 89],
    [146, 103, 86],
    [145, 101, 88],
    [150, 108, 97],
    [155, 115, 105],
    [160, 123, 113],
    [166, 131, 121],
    [171, 138, 128],
    [177, 146, 137],
    [183, 153, 145],
    [189, 161, 153],
    [195, 169, 161],
    [201, 176, 169],
    [207, 184, 177],
    [213, 192, 185],
    [220, 200, 193],
    [226, 207, 201],
    [232, 215, 209],
    [238, 223, 217],
    [244, 231, 225],
];

/// Upper bounds (percent) of the slope classes; the last class is open.
const SLOPE_BREAKS: [f32; 6] = [3.0, 5.0, 8.0, 15.0, 25.0, 50.0];
const SLOPE_COLORS: [[u8; 3]; 7] = [
    [26, 150, 65],
    [166, 217, 106],
    [255, 255, 191],
    [253, 174, 97],
    [215, 25, 28],
    [128, 0, 38],
    [0, 0, 0],
];

/// N, NE, E, SE, S, SW, W, NW; flat cells (negative aspect) are grey.
const ASPECT_COLORS: [[u8; 3]; 9] = [
    [230, 0, 0],
    [255, 166, 0],
    [255, 255, 0],
    [0, 230, 0],
    [0, 255, 255],
    [0, 166, 255],
    [0, 0, 255],
    [255, 0, 255],
    [158, 158, 158],
];

/// Geomorphon classes 1..=10: flat, peak, ridge, shoulder, spur, slope,
/// hollow, footslope, valley, pit.
const LANDFORM_COLORS: [[u8; 3]; 10] = [
    [113, 113, 113],
    [83, 5, 14],
    [186, 34, 49],
    [212, 95, 32],
    [229, 204, 91],
    [233, 233, 152],
    [166, 186, 98],
    [17, 90, 21],
    [105, 129, 149],
    [0, 0, 0],
];

const FLOW_STEPS: usize = 8;
const FLOW_COLORS: [[u8; 3]; FLOW_STEPS] = [
    [247, 251, 255],
    [222, 235, 247],
    [198, 219, 239],
    [158, 202, 225],
    [107, 174, 214],
    [66, 146, 198],
    [33, 113, 181],
    [8, 69, 148],
];

/// Value-domain-specific colouring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMap {
    /// 49-step hypsometric ramp stretched over the raster's range.
    Elevation,
    /// Seven slope-percent classes.
    SlopeClasses,
    /// Eight compass sectors in degrees clockwise from north.
    AspectSectors,
    /// Linear grey stretch over the raster's range.
    Grayscale,
    /// Ten geomorphon landform classes.
    Landforms,
    /// Log-scaled blues for flow accumulation.
    FlowAccumulation,
}

/// Precomputed lookup for one raster: a palette plus whatever range the
/// value-to-index mapping needs.
struct Lut {
    map: ColorMap,
    palette: Vec<[u8; 3]>,
    min: f32,
    span: f32,
}

impl Lut {
    fn new(map: ColorMap, min: f32, max: f32) -> Self {
        let palette = match map {
            ColorMap::Elevation => std::iter::once(ELEVATION_LOW)
                .chain(ELEVATION_RAMP)
                .chain(std::iter::once(ELEVATION_HIGH))
                .collect(),
            ColorMap::SlopeClasses => SLOPE_COLORS.to_vec(),
            ColorMap::AspectSectors => ASPECT_COLORS.to_vec(),
            ColorMap::Grayscale => (0..=255u8).map(|g| [g, g, g]).collect(),
            ColorMap::Landforms => LANDFORM_COLORS.to_vec(),
            ColorMap::FlowAccumulation => FLOW_COLORS.to_vec(),
        };
        let (min, max) = match map {
            ColorMap::FlowAccumulation => (0.0, max.max(1.0).ln_1p()),
            _ => (min, max),
        };
        Self {
            map,
            palette,
            min,
            span: (max - min).max(f32::EPSILON),
        }
    }

    /// Palette index for a valid value, `None` if it has no class.
    fn index(&self, v: f32) -> Option<usize> {
        let stretch = |v: f32| (v - self.min) / self.span;
        let idx = match self.map {
            ColorMap::Elevation => {
                let norm = stretch(v);
                if norm < 0.0 {
                    0
                } else if norm > 1.0 {
                    ELEVATION_RAMP.len() + 1
                } else {
                    (norm * (ELEVATION_RAMP.len() - 1) as f32) as usize + 1
                }
            }
            ColorMap::SlopeClasses => SLOPE_BREAKS.iter().take_while(|b| v >= **b).count(),
            ColorMap::AspectSectors => {
                if v < 0.0 {
                    8
                } else {
                    (((v % 360.0) + 22.5) / 45.0) as usize % 8
                }
            }
            ColorMap::Grayscale => (stretch(v).clamp(0.0, 1.0) * 255.0).round() as usize,
            ColorMap::Landforms => {
                let class = v.round() as i64;
                if !(1..=10).contains(&class) {
                    return None;
                }
                class as usize - 1
            }
            ColorMap::FlowAccumulation => {
                let norm = stretch(v.max(0.0).ln_1p()).clamp(0.0, 1.0);
                ((norm * FLOW_STEPS as f32) as usize).min(FLOW_STEPS - 1)
            }
        };
        Some(idx)
    }
}

/// Colour `raster` band 0 with `map`, transparent outside `footprint`.
///
/// Range-stretched maps use the min and max of the raster's valid pixels.
/// Footprint and raster must share a CRS.
pub fn render_preview(raster: &Raster, footprint: &Footprint, map: ColorMap) -> Result<RgbaImage> {
    let (min, max) = raster
        .valid_values(0)
        .fold(None, |acc: Option<(f32, f32)>, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
        .ok_or(AnalysisError::NoValidPixels)?;
    let lut = Lut::new(map, min, max);

    let width = raster.width();
    let transform = *raster.transform();
    let band = raster.band(0);
    let mut pixels = vec![0u8; width * raster.height() * 4];
    pixels
        .par_chunks_mut(width * 4)
        .enumerate()
        .for_each(|(row, out)| {
            for col in 0..width {
                let v = band[row * width + col];
                if raster.is_nodata(v) {
                    continue;
                }
                let (x, y) = transform.pixel_center(col, row);
                if !footprint.contains_or_near(x, y, 0.0) {
                    continue;
                }
                if let Some(color) = lut.index(v).and_then(|i| lut.palette.get(i)) {
                    out[col * 4..col * 4 + 4].copy_from_slice(&[color[0], color[1], color[2], 255]);
                }
            }
        });

    RgbaImage::from_raw(width as u32, raster.height() as u32, pixels).ok_or_else(|| {
        AnalysisError::Image(image::ImageError::Parameter(
            image::error::ParameterError::from_kind(
                image::error::ParameterErrorKind::DimensionMismatch,
            ),
        ))
    })
}

/// Render and write a preview PNG.
pub fn write_preview(raster: &Raster, footprint: &Footprint, map: ColorMap, path: &Path) -> Result<()> {
    let img = render_preview(raster, footprint, map)?;
    let mut bytes = std::io::Cursor::new(Vec::new());
    img.write_to(&mut bytes, image::ImageFormat::Png)?;
    write_atomic(path, bytes.get_ref()).map_err(terrasight_dem::DemError::from)?;
    Ok(())
}

/// Colour of a pixel, or `None` when transparent.
pub fn pixel_color(img: &RgbaImage, col: u32, row: u32) -> Option<[u8; 3]> {
    let Rgba([r, g, b, a]) = *img.get_pixel(col, row);
    (a > 0).then_some([r, g, b])
}
