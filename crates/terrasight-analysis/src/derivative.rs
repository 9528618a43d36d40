//! The fixed catalogue of terrain derivatives.

use crate::preview::ColorMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default contour spacing in elevation units.
pub const DEFAULT_CONTOUR_INTERVAL: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Derivative {
    Slope,
    Aspect,
    Hillshade,
    Geomorphons,
    Drainage,
    Contours,
}

impl Derivative {
    pub const ALL: [Derivative; 6] = [
        Derivative::Slope,
        Derivative::Aspect,
        Derivative::Hillshade,
        Derivative::Geomorphons,
        Derivative::Drainage,
        Derivative::Contours,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Derivative::Slope => "slope",
            Derivative::Aspect => "aspect",
            Derivative::Hillshade => "hillshade",
            Derivative::Geomorphons => "geomorphons",
            Derivative::Drainage => "drainage",
            Derivative::Contours => "contours",
        }
    }

    /// Output file name inside the session directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Derivative::Slope => "slope.tif",
            Derivative::Aspect => "aspect.tif",
            Derivative::Hillshade => "hillshade.tif",
            Derivative::Geomorphons => "geomorphons.tif",
            Derivative::Drainage => "drainage.tif",
            Derivative::Contours => "contours.geojson",
        }
    }

    pub fn preview_file_name(&self) -> String {
        format!("{}_preview.png", self.name())
    }

    /// Contours are vectors; everything else is a single-band raster.
    pub fn is_raster(&self) -> bool {
        !matches!(self, Derivative::Contours)
    }

    /// Colour map for the preview. Contours are previewed over the
    /// elevation they were traced from.
    pub fn color_map(&self) -> ColorMap {
        match self {
            Derivative::Slope => ColorMap::SlopeClasses,
            Derivative::Aspect => ColorMap::AspectSectors,
            Derivative::Hillshade => ColorMap::Grayscale,
            Derivative::Geomorphons => ColorMap::Landforms,
            Derivative::Drainage => ColorMap::FlowAccumulation,
            Derivative::Contours => ColorMap::Elevation,
        }
    }
}

impl fmt::Display for Derivative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Derivative {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        Derivative::ALL
            .into_iter()
            .find(|d| d.name() == s || (s == "drainage_network" && *d == Derivative::Drainage))
            .ok_or_else(|| format!("unknown derivative '{}'", s))
    }
}
