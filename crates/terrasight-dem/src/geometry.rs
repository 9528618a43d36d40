//! Area-of-interest geometry: GeoJSON parsing, bounding boxes and the
//! point/extent predicates used by tile lookup and clipping.

use crate::{DemError, Result};
use geo::{
    Area, BoundingRect, Coord, EuclideanDistance, Intersects, LineString, MultiPolygon, Point,
    Polygon, Rect,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Axis-aligned bounding box in the units of whatever CRS it was built in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// West edge.
    pub min_x: f64,
    /// South edge.
    pub min_y: f64,
    /// East edge.
    pub max_x: f64,
    /// North edge.
    pub max_y: f64,
}

impl BoundingBox {
    /// Create a box from its edges, normalising the corner order.
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            min_x: x0.min(x1),
            min_y: y0.min(y1),
            max_x: x0.max(x1),
            max_y: y0.max(y1),
        }
    }

    /// Smallest box containing every point, or `None` for an empty iterator.
    pub fn from_points<I: IntoIterator<Item = (f64, f64)>>(points: I) -> Option<Self> {
        points.into_iter().fold(None, |acc, (x, y)| {
            Some(match acc {
                None => Self::new(x, y, x, y),
                Some(b) => Self {
                    min_x: b.min_x.min(x),
                    min_y: b.min_y.min(y),
                    max_x: b.max_x.max(x),
                    max_y: b.max_y.max(y),
                },
            })
        })
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// Grow the box by `d` on every side.
    pub fn buffered(&self, d: f64) -> Self {
        Self {
            min_x: self.min_x - d,
            min_y: self.min_y - d,
            max_x: self.max_x + d,
            max_y: self.max_y + d,
        }
    }

    /// Cheap overlap test. Boxes that only touch count as intersecting.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// True when `other` lies entirely inside `self`, allowing `tolerance` slack.
    pub fn contains_box(&self, other: &BoundingBox, tolerance: f64) -> bool {
        other.min_x >= self.min_x - tolerance
            && other.max_x <= self.max_x + tolerance
            && other.min_y >= self.min_y - tolerance
            && other.max_y <= self.max_y + tolerance
    }

    pub fn union(&self, other: &BoundingBox) -> Self {
        Self {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Overlapping region, or `None` when the boxes are disjoint.
    pub fn intersection(&self, other: &BoundingBox) -> Option<Self> {
        let b = Self {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        };
        (b.min_x < b.max_x && b.min_y < b.max_y).then_some(b)
    }

    /// Points sampled along the four edges, `per_edge` points per edge.
    ///
    /// Used to compute reprojected envelopes, where corners alone miss the
    /// bulge of curved edges.
    pub fn edge_points(&self, per_edge: usize) -> Vec<(f64, f64)> {
        let n = per_edge.max(2);
        let mut points = Vec::with_capacity(n * 4);
        for i in 0..n {
            let t = i as f64 / (n - 1) as f64;
            let x = self.min_x + t * self.width();
            let y = self.min_y + t * self.height();
            points.push((x, self.min_y));
            points.push((x, self.max_y));
            points.push((self.min_x, y));
            points.push((self.max_x, y));
        }
        points
    }

    pub fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            Coord {
                x: self.min_x,
                y: self.min_y,
            },
            Coord {
                x: self.max_x,
                y: self.max_y,
            },
        )
    }
}

impl From<Rect<f64>> for BoundingBox {
    fn from(rect: Rect<f64>) -> Self {
        Self::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

/// Polygonal geometry together with its precomputed bounding box.
#[derive(Debug, Clone)]
pub struct Footprint {
    polygons: MultiPolygon<f64>,
    bbox: BoundingBox,
}

impl Footprint {
    /// Validate and wrap a multipolygon.
    pub fn new(polygons: MultiPolygon<f64>) -> Result<Self> {
        if polygons.0.is_empty() {
            return Err(DemError::InvalidGeometry("no polygons".to_string()));
        }
        for polygon in &polygons.0 {
            let ring = polygon.exterior();
            if ring.0.len() < 4 {
                return Err(DemError::InvalidGeometry(format!(
                    "exterior ring has {} points, need at least 4",
                    ring.0.len()
                )));
            }
            if ring.coords().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
                return Err(DemError::InvalidGeometry(
                    "non-finite coordinate".to_string(),
                ));
            }
        }
        if polygons.unsigned_area() <= 0.0 {
            return Err(DemError::InvalidGeometry("zero-area polygon".to_string()));
        }
        let bbox = polygons
            .bounding_rect()
            .map(BoundingBox::from)
            .ok_or_else(|| DemError::InvalidGeometry("empty geometry".to_string()))?;
        Ok(Self { polygons, bbox })
    }

    pub fn polygons(&self) -> &MultiPolygon<f64> {
        &self.polygons
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    /// Planar area in squared CRS units.
    pub fn area(&self) -> f64 {
        self.polygons.unsigned_area()
    }

    /// Exact test of whether the polygon touches the given extent.
    pub fn intersects_bbox(&self, extent: &BoundingBox) -> bool {
        self.polygons.intersects(&extent.to_rect())
    }

    /// Point-in-polygon with a buffer: true when `(x, y)` is inside, on the
    /// boundary, or within `tolerance` of the polygon.
    pub fn contains_or_near(&self, x: f64, y: f64, tolerance: f64) -> bool {
        if !self.bbox.buffered(tolerance).contains_point(x, y) {
            return false;
        }
        let point = Point::new(x, y);
        if self.polygons.intersects(&point) {
            return true;
        }
        tolerance > 0.0 && point.euclidean_distance(&self.polygons) <= tolerance
    }

    /// Rebuild the footprint with every vertex passed through `f`.
    pub fn try_map<F>(&self, mut f: F) -> Result<Footprint>
    where
        F: FnMut(f64, f64) -> Result<(f64, f64)>,
    {
        let mut map_ring = |ring: &LineString<f64>| -> Result<LineString<f64>> {
            ring.coords()
                .map(|c| f(c.x, c.y).map(|(x, y)| Coord { x, y }))
                .collect::<Result<Vec<_>>>()
                .map(LineString::new)
        };
        let mut polygons = Vec::with_capacity(self.polygons.0.len());
        for polygon in &self.polygons.0 {
            let exterior = map_ring(polygon.exterior())?;
            let interiors = polygon
                .interiors()
                .iter()
                .map(&mut map_ring)
                .collect::<Result<Vec<_>>>()?;
            polygons.push(Polygon::new(exterior, interiors));
        }
        Footprint::new(MultiPolygon::new(polygons))
    }
}

/// The user polygon a job is run against: WGS84 lon/lat geometry plus an id.
///
/// Immutable once constructed.
#[derive(Debug, Clone)]
pub struct AreaOfInterest {
    id: String,
    footprint: Footprint,
}

impl AreaOfInterest {
    pub fn new(id: impl Into<String>, footprint: Footprint) -> Self {
        Self {
            id: id.into(),
            footprint,
        }
    }

    /// Parse a GeoJSON `FeatureCollection` (first feature), `Feature`, or bare
    /// `Polygon`/`MultiPolygon` geometry.
    pub fn from_geojson(id: impl Into<String>, geojson: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(geojson)?;
        let polygons = parse_geometry(&value)?;
        Ok(Self::new(id, Footprint::new(polygons)?))
    }

    /// Rectangular AOI, handy for tile listing.
    pub fn from_bbox(id: impl Into<String>, bbox: BoundingBox) -> Result<Self> {
        let polygon = bbox.to_rect().to_polygon();
        Ok(Self::new(id, Footprint::new(MultiPolygon::new(vec![polygon]))?))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn footprint(&self) -> &Footprint {
        &self.footprint
    }

    pub fn bbox(&self) -> BoundingBox {
        self.footprint.bbox()
    }
}

fn parse_geometry(value: &Value) -> Result<MultiPolygon<f64>> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DemError::InvalidGeometry("missing GeoJSON type".to_string()))?;

    match kind {
        "FeatureCollection" => {
            let first = value
                .get("features")
                .and_then(Value::as_array)
                .and_then(|features| features.first())
                .ok_or_else(|| {
                    DemError::InvalidGeometry("feature collection is empty".to_string())
                })?;
            parse_geometry(first)
        }
        "Feature" => {
            let geometry = value
                .get("geometry")
                .ok_or_else(|| DemError::InvalidGeometry("feature has no geometry".to_string()))?;
            parse_geometry(geometry)
        }
        "Polygon" => {
            let rings = coordinates(value)?;
            Ok(MultiPolygon::new(vec![parse_polygon(rings)?]))
        }
        "MultiPolygon" => {
            let polygons = coordinates(value)?
                .as_array()
                .ok_or_else(|| DemError::InvalidGeometry("bad MultiPolygon".to_string()))?
                .iter()
                .map(parse_polygon)
                .collect::<Result<Vec<_>>>()?;
            Ok(MultiPolygon::new(polygons))
        }
        other => Err(DemError::InvalidGeometry(format!(
            "unsupported geometry type '{}'",
            other
        ))),
    }
}

fn coordinates(value: &Value) -> Result<&Value> {
    value
        .get("coordinates")
        .ok_or_else(|| DemError::InvalidGeometry("geometry has no coordinates".to_string()))
}

fn parse_polygon(rings: &Value) -> Result<Polygon<f64>> {
    let rings = rings
        .as_array()
        .ok_or_else(|| DemError::InvalidGeometry("polygon rings must be an array".to_string()))?;
    let mut parsed = rings.iter().map(parse_ring);
    let exterior = parsed
        .next()
        .ok_or_else(|| DemError::InvalidGeometry("polygon has no rings".to_string()))??;
    let interiors = parsed.collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn parse_ring(ring: &Value) -> Result<LineString<f64>> {
    let positions = ring
        .as_array()
        .ok_or_else(|| DemError::InvalidGeometry("ring must be an array".to_string()))?;
    positions
        .iter()
        .map(|p| match p.as_array().map(Vec::as_slice) {
            Some([x, y, ..]) => match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => Ok(Coord { x, y }),
                _ => Err(DemError::InvalidGeometry(format!("bad position {}", p))),
            },
            _ => Err(DemError::InvalidGeometry(format!("bad position {}", p))),
        })
        .collect::<Result<Vec<_>>>()
        .map(LineString::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: &str = r#"{
        "type": "Feature",
        "properties": {},
        "geometry": {
            "type": "Polygon",
            "coordinates": [[[-122.6, 47.2], [-122.2, 47.2], [-122.2, 47.6], [-122.6, 47.6], [-122.6, 47.2]]]
        }
    }"#;

    #[test]
    fn test_parse_feature_polygon() {
        let aoi = AreaOfInterest::from_geojson("a1", SQUARE).unwrap();
        let bbox = aoi.bbox();
        assert_eq!(aoi.id(), "a1");
        assert_eq!(bbox.min_x, -122.6);
        assert_eq!(bbox.max_x, -122.2);
        assert_eq!(bbox.min_y, 47.2);
        assert_eq!(bbox.max_y, 47.6);
    }

    #[test]
    fn test_parse_feature_collection_and_multipolygon() {
        let fc = r#"{"type":"FeatureCollection","features":[{"type":"Feature","geometry":
            {"type":"MultiPolygon","coordinates":[[[[0,0],[1,0],[1,1],[0,1],[0,0]]],[[[2,2],[3,2],[3,3],[2,2]]]]}}]}"#;
        let aoi = AreaOfInterest::from_geojson("mp", fc).unwrap();
        assert_eq!(aoi.footprint().polygons().0.len(), 2);
        assert_eq!(aoi.bbox(), BoundingBox::new(0.0, 0.0, 3.0, 3.0));
    }

    #[test]
    fn test_rejects_non_polygon() {
        let point = r#"{"type":"Point","coordinates":[1.0,2.0]}"#;
        assert!(matches!(
            AreaOfInterest::from_geojson("p", point),
            Err(DemError::InvalidGeometry(_))
        ));
        let degenerate = r#"{"type":"Polygon","coordinates":[[[0,0],[1,1],[0,0]]]}"#;
        assert!(AreaOfInterest::from_geojson("d", degenerate).is_err());
    }

    #[test]
    fn test_contains_or_near_buffer() {
        let aoi = AreaOfInterest::from_geojson("a1", SQUARE).unwrap();
        let fp = aoi.footprint();
        assert!(fp.contains_or_near(-122.4, 47.4, 0.0));
        // On the boundary.
        assert!(fp.contains_or_near(-122.6, 47.4, 0.0));
        // Just outside, inside the buffer.
        assert!(!fp.contains_or_near(-122.6005, 47.4, 0.0));
        assert!(fp.contains_or_near(-122.6005, 47.4, 0.001));
        assert!(!fp.contains_or_near(-122.7, 47.4, 0.001));
    }

    #[test]
    fn test_bbox_intersection_and_union() {
        let a = BoundingBox::new(0.0, 0.0, 2.0, 2.0);
        let b = BoundingBox::new(1.0, 1.0, 3.0, 3.0);
        let c = BoundingBox::new(5.0, 5.0, 6.0, 6.0);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.intersection(&b), Some(BoundingBox::new(1.0, 1.0, 2.0, 2.0)));
        assert_eq!(a.intersection(&c), None);
        assert_eq!(a.union(&c), BoundingBox::new(0.0, 0.0, 6.0, 6.0));
    }

    #[test]
    fn test_exact_intersection_differs_from_bbox() {
        // A thin diagonal triangle whose bbox covers the test extent but whose
        // area does not.
        let tri = r#"{"type":"Polygon","coordinates":[[[0,0],[10,0],[10,10],[0,0]]]}"#;
        let aoi = AreaOfInterest::from_geojson("t", tri).unwrap();
        let corner = BoundingBox::new(0.5, 8.0, 1.5, 9.0);
        assert!(aoi.bbox().intersects(&corner));
        assert!(!aoi.footprint().intersects_bbox(&corner));
    }

    #[test]
    fn test_try_map_translates() {
        let aoi = AreaOfInterest::from_geojson("a1", SQUARE).unwrap();
        let moved = aoi
            .footprint()
            .try_map(|x, y| Ok((x + 1.0, y - 1.0)))
            .unwrap();
        let bbox = moved.bbox();
        assert!((bbox.min_x - -121.6).abs() < 1e-9);
        assert!((bbox.max_y - 46.6).abs() < 1e-9);
    }
}
