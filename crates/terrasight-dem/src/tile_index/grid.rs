//! Grid-named SRTM tiles with a local cache and ordered download mirrors.

use super::{RawTile, TileFormat, TileIndex, TileSet};
use crate::cache::{write_atomic, DownloadTracker};
use crate::crs::Crs;
use crate::geometry::{AreaOfInterest, BoundingBox};
use crate::hgt::{decode_hgt, extract_hgt_from_zip};
use crate::source::ElevationSource;
use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use terrasight_metrics::{metric_defs, PipelineLabels};
use tracing::{debug, info, warn};

/// Mirrors tried in order for `{tile}.SRTMGL1.hgt.zip`.
pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://e4ftl01.cr.usgs.gov/MEASURES/SRTMGL1.003/2000.02.11",
    "https://srtm.csi.cgiar.org/wp-content/uploads/files/srtm_5x5/TIFF",
];

/// Margin added around the AOI box before enumerating cells, in degrees.
pub const DEFAULT_BUFFER_DEG: f64 = 0.1;

/// Nominal SRTM 1 arc-second pixel size in degrees.
const ARC_SECOND: f64 = 1.0 / 3600.0;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// SRTM index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SrtmOptions {
    /// Where extracted `.hgt` files (and any pre-seeded zips) live.
    pub cache_dir: PathBuf,
    /// Base URLs, tried in order.
    pub mirrors: Vec<String>,
    /// Never touch the network; uncached tiles are reported missing.
    pub offline: bool,
    /// Margin around the AOI bounding box in degrees.
    pub buffer_deg: f64,
}

impl Default for SrtmOptions {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data/srtm"),
            mirrors: DEFAULT_MIRRORS.iter().map(|m| m.to_string()).collect(),
            offline: false,
            buffer_deg: DEFAULT_BUFFER_DEG,
        }
    }
}

/// A 1x1 degree SRTM cell, keyed by its south-west corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SrtmTile {
    pub lat: i32,
    pub lon: i32,
}

impl SrtmTile {
    pub fn new(lat: i32, lon: i32) -> Self {
        Self { lat, lon }
    }

    /// Canonical name such as `N47W123`.
    pub fn name(&self) -> String {
        format!(
            "{}{:02}{}{:03}",
            if self.lat >= 0 { 'N' } else { 'S' },
            self.lat.unsigned_abs(),
            if self.lon >= 0 { 'E' } else { 'W' },
            self.lon.unsigned_abs()
        )
    }

    /// Name of the distributed archive.
    pub fn archive_name(&self) -> String {
        format!("{}.SRTMGL1.hgt.zip", self.name())
    }

    pub fn hgt_name(&self) -> String {
        format!("{}.hgt", self.name())
    }

    /// Local path of the extracted height file.
    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(self.hgt_name())
    }

    /// Cell extent in degrees.
    pub fn bounds(&self) -> BoundingBox {
        BoundingBox::new(
            self.lon as f64,
            self.lat as f64,
            self.lon as f64 + 1.0,
            self.lat as f64 + 1.0,
        )
    }

    /// Parse a name like `N47W123` (anything after the first 7 characters is
    /// ignored, so `N47W123.SRTMGL1.hgt.zip` works too).
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || DemError::InvalidTileName(name.to_string());
        let head = name.get(..7).ok_or_else(invalid)?;
        let lat_sign = match head.as_bytes()[0].to_ascii_uppercase() {
            b'N' => 1,
            b'S' => -1,
            _ => return Err(invalid()),
        };
        let lon_sign = match head.as_bytes()[3].to_ascii_uppercase() {
            b'E' => 1,
            b'W' => -1,
            _ => return Err(invalid()),
        };
        let lat: i32 = head[1..3].parse().map_err(|_| invalid())?;
        let lon: i32 = head[4..7].parse().map_err(|_| invalid())?;
        Ok(Self::new(lat_sign * lat, lon_sign * lon))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| DemError::InvalidTileName(path.display().to_string()))?;
        Self::parse(name)
    }
}

/// Every cell touched by `bbox` grown by `buffer` degrees, row-major from
/// the south-west.
///
/// Cells span `floor(min) ..= ceil(max) - 1` on each axis.
pub fn tiles_for_bbox(bbox: &BoundingBox, buffer: f64) -> Vec<SrtmTile> {
    let b = bbox.buffered(buffer);
    let lat_lo = (b.min_y.floor() as i32).clamp(-90, 89);
    let lat_hi = ((b.max_y.ceil() as i32) - 1).clamp(lat_lo, 89);
    let lon_lo = (b.min_x.floor() as i32).clamp(-180, 179);
    let lon_hi = ((b.max_x.ceil() as i32) - 1).clamp(lon_lo, 179);

    (lat_lo..=lat_hi)
        .flat_map(|lat| (lon_lo..=lon_hi).map(move |lon| SrtmTile::new(lat, lon)))
        .collect()
}

/// Fetches a URL's body. Abstracted so tests can stand in for the network.
pub trait TileFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Blocking HTTP fetcher with optional basic-auth credentials.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    credentials: Option<(String, String)>,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("authenticated", &self.credentials.is_some())
            .finish()
    }
}

impl HttpFetcher {
    pub fn new(credentials: Option<(String, String)>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            credentials,
        })
    }

    /// Credentials from `EARTHDATA_USERNAME` / `EARTHDATA_PASSWORD`, when both
    /// are set.
    pub fn from_env() -> Result<Self> {
        let credentials = match (
            std::env::var("EARTHDATA_USERNAME"),
            std::env::var("EARTHDATA_PASSWORD"),
        ) {
            (Ok(user), Ok(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        };
        Self::new(credentials)
    }
}

impl TileFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut request = self.client.get(url);
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request.send()?;
        if !response.status().is_success() {
            return Err(DemError::TileDownloadFailed {
                tile: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }
        let bytes = response.bytes()?;
        if bytes.is_empty() {
            return Err(DemError::TileDownloadFailed {
                tile: url.to_string(),
                reason: "empty response body".to_string(),
            });
        }
        Ok(bytes.to_vec())
    }
}

/// Grid-naming tile index for SRTM.
pub struct SrtmIndex {
    options: SrtmOptions,
    fetcher: Arc<dyn TileFetcher>,
    downloads: DownloadTracker<SrtmTile>,
}

impl SrtmIndex {
    pub fn new(options: SrtmOptions, fetcher: Arc<dyn TileFetcher>) -> Self {
        Self {
            options,
            fetcher,
            downloads: DownloadTracker::new(),
        }
    }

    pub fn options(&self) -> &SrtmOptions {
        &self.options
    }

    pub fn download_stats(&self) -> crate::cache::DownloadStats {
        self.downloads.stats()
    }

    /// Make sure the tile's `.hgt` is in the cache and return its path.
    pub fn ensure_cached(&self, tile: SrtmTile) -> Result<PathBuf> {
        let labels = PipelineLabels::new(ElevationSource::Srtm.id()).to_labels();
        let hgt_path = tile.cache_path(&self.options.cache_dir);
        if hgt_path.exists() {
            metrics::counter!(metric_defs::TILE_CACHE_HITS.name, labels.as_slice()).increment(1);
            return Ok(hgt_path);
        }

        let zip_path = self.options.cache_dir.join(tile.archive_name());
        if zip_path.exists() {
            debug!(tile = %tile.name(), "extracting cached archive");
            let hgt = extract_hgt_from_zip(&std::fs::read(&zip_path)?)?;
            decode_hgt(&hgt, tile, &zip_path.display().to_string())?;
            write_atomic(&hgt_path, &hgt)?;
            metrics::counter!(metric_defs::TILE_CACHE_HITS.name, labels.as_slice()).increment(1);
            return Ok(hgt_path);
        }

        if self.options.offline {
            return Err(DemError::TileDownloadFailed {
                tile: tile.name(),
                reason: "not cached and offline mode is on".to_string(),
            });
        }

        self.downloads
            .fetch(&tile, || hgt_path.exists(), || self.download(tile, &hgt_path))
            .map_err(|reason| DemError::TileDownloadFailed {
                tile: tile.name(),
                reason,
            })?;
        Ok(hgt_path)
    }

    /// Try each mirror in turn; the first that yields a valid tile wins.
    fn download(&self, tile: SrtmTile, hgt_path: &Path) -> std::result::Result<u64, String> {
        let labels = PipelineLabels::new(ElevationSource::Srtm.id()).to_labels();
        let archive = tile.archive_name();
        let mut last_error = "no mirrors configured".to_string();

        for mirror in &self.options.mirrors {
            let url = format!("{}/{}", mirror.trim_end_matches('/'), archive);
            let attempt = self.fetcher.fetch(&url).and_then(|bytes| {
                let hgt = extract_hgt_from_zip(&bytes)?;
                decode_hgt(&hgt, tile, &url)?;
                write_atomic(hgt_path, &hgt)?;
                Ok(bytes.len() as u64)
            });
            match attempt {
                Ok(size) => {
                    info!(tile = %tile.name(), %url, bytes = size, "downloaded SRTM tile");
                    metrics::counter!(metric_defs::TILES_DOWNLOADED.name, labels.as_slice())
                        .increment(1);
                    metrics::counter!(metric_defs::TILE_BYTES.name, labels.as_slice())
                        .increment(size);
                    return Ok(size);
                }
                Err(e) => {
                    warn!(tile = %tile.name(), %url, error = %e, "mirror failed, trying next");
                    metrics::counter!(metric_defs::MIRROR_FAILURES.name, labels.as_slice())
                        .increment(1);
                    last_error = e.to_string();
                }
            }
        }
        Err(format!(
            "all {} mirrors failed; last error: {}",
            self.options.mirrors.len(),
            last_error
        ))
    }
}

impl TileIndex for SrtmIndex {
    fn source(&self) -> ElevationSource {
        ElevationSource::Srtm
    }

    fn resolve(&self, aoi: &AreaOfInterest) -> Result<TileSet> {
        let wanted = tiles_for_bbox(&aoi.bbox(), self.options.buffer_deg);
        info!(aoi = aoi.id(), tiles = wanted.len(), "resolving SRTM tiles");

        let mut set = TileSet::default();
        for tile in wanted {
            match self.ensure_cached(tile) {
                Ok(path) => set.tiles.push(RawTile {
                    path,
                    crs: Crs::WGS84,
                    bounds: tile.bounds(),
                    resolution: (ARC_SECOND, ARC_SECOND),
                    format: TileFormat::Hgt,
                }),
                Err(e) => {
                    // Ocean cells do not exist upstream; a gap is not fatal here.
                    warn!(tile = %tile.name(), error = %e, "SRTM tile unavailable");
                    set.missing.push(tile.name());
                }
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::Write;

    fn hgt_bytes(side: usize, value: i16) -> Vec<u8> {
        std::iter::repeat(value.to_be_bytes())
            .take(side * side)
            .flatten()
            .collect()
    }

    fn zipped(name: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut out));
            writer
                .start_file(name, zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(payload).unwrap();
            writer.finish().unwrap();
        }
        out
    }

    /// Serves canned bodies by URL and records every request.
    struct FakeFetcher {
        responses: Vec<(String, Vec<u8>)>,
        requests: Mutex<Vec<String>>,
    }

    impl TileFetcher for FakeFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.requests.lock().push(url.to_string());
            self.responses
                .iter()
                .find(|(u, _)| u == url)
                .map(|(_, body)| body.clone())
                .ok_or_else(|| DemError::TileDownloadFailed {
                    tile: url.to_string(),
                    reason: "HTTP 404 Not Found".to_string(),
                })
        }
    }

    #[test]
    fn test_tile_names() {
        assert_eq!(SrtmTile::new(47, -123).name(), "N47W123");
        assert_eq!(SrtmTile::new(-8, 5).name(), "S08E005");
        assert_eq!(SrtmTile::new(0, 0).archive_name(), "N00E000.SRTMGL1.hgt.zip");
        assert_eq!(SrtmTile::parse("N47W123").unwrap(), SrtmTile::new(47, -123));
        assert_eq!(
            SrtmTile::parse("s08e005.SRTMGL1.hgt.zip").unwrap(),
            SrtmTile::new(-8, 5)
        );
        assert!(SrtmTile::parse("X47W123").is_err());
        assert!(SrtmTile::parse("N4").is_err());
    }

    #[test]
    fn test_tiles_for_bbox_buffer_and_range() {
        // AOI well inside one cell: the 0.1 degree buffer does not cross.
        let inside = BoundingBox::new(-122.6, 47.3, -122.4, 47.5);
        assert_eq!(tiles_for_bbox(&inside, 0.1), vec![SrtmTile::new(47, -123)]);

        // Close to the east edge: the buffer pulls in the neighbour.
        let edge = BoundingBox::new(-122.3, 47.3, -122.05, 47.5);
        assert_eq!(
            tiles_for_bbox(&edge, 0.1),
            vec![SrtmTile::new(47, -123), SrtmTile::new(47, -122)]
        );

        // Two by two block across the equator and the prime meridian.
        let cross = BoundingBox::new(-0.5, -0.5, 0.5, 0.5);
        let tiles = tiles_for_bbox(&cross, 0.0);
        assert_eq!(tiles.len(), 4);
        assert!(tiles.contains(&SrtmTile::new(-1, -1)));
        assert!(tiles.contains(&SrtmTile::new(0, 0)));
    }

    #[test]
    fn test_mirror_fallback_first_success_wins() {
        let dir = tempfile::tempdir().unwrap();
        let tile = SrtmTile::new(10, 20);
        let good = zipped("N10E020.hgt", &hgt_bytes(3, 42));
        let fetcher = Arc::new(FakeFetcher {
            responses: vec![
                ("https://b.example/N10E020.SRTMGL1.hgt.zip".to_string(), good.clone()),
                ("https://c.example/N10E020.SRTMGL1.hgt.zip".to_string(), good),
            ],
            requests: Mutex::new(Vec::new()),
        });
        let index = SrtmIndex::new(
            SrtmOptions {
                cache_dir: dir.path().to_path_buf(),
                mirrors: vec![
                    "https://a.example".to_string(),
                    "https://b.example/".to_string(),
                    "https://c.example".to_string(),
                ],
                offline: false,
                buffer_deg: 0.1,
            },
            fetcher.clone(),
        );

        let path = index.ensure_cached(tile).unwrap();
        assert!(path.ends_with("N10E020.hgt"));
        assert_eq!(
            *fetcher.requests.lock(),
            vec![
                "https://a.example/N10E020.SRTMGL1.hgt.zip".to_string(),
                "https://b.example/N10E020.SRTMGL1.hgt.zip".to_string(),
            ]
        );

        // Second call is a cache hit with no further requests.
        index.ensure_cached(tile).unwrap();
        assert_eq!(fetcher.requests.lock().len(), 2);
        assert_eq!(index.download_stats().files_downloaded, 1);
    }

    #[test]
    fn test_all_mirrors_fail_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher {
            responses: vec![],
            requests: Mutex::new(Vec::new()),
        });
        let index = SrtmIndex::new(
            SrtmOptions {
                cache_dir: dir.path().to_path_buf(),
                mirrors: vec!["https://a.example".to_string(), "https://b.example".to_string()],
                offline: false,
                buffer_deg: 0.0,
            },
            fetcher.clone(),
        );
        let aoi = AreaOfInterest::from_bbox("sea", BoundingBox::new(-30.6, 10.2, -30.4, 10.4)).unwrap();
        let set = index.resolve(&aoi).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.missing, vec!["N10W031".to_string()]);
        assert_eq!(fetcher.requests.lock().len(), 2);
    }

    #[test]
    fn test_offline_uses_cached_zip_only() {
        let dir = tempfile::tempdir().unwrap();
        let tile = SrtmTile::new(1, 1);
        std::fs::write(
            dir.path().join(tile.archive_name()),
            zipped("N01E001.hgt", &hgt_bytes(3, 9)),
        )
        .unwrap();
        let fetcher = Arc::new(FakeFetcher {
            responses: vec![],
            requests: Mutex::new(Vec::new()),
        });
        let index = SrtmIndex::new(
            SrtmOptions {
                cache_dir: dir.path().to_path_buf(),
                offline: true,
                ..SrtmOptions::default()
            },
            fetcher.clone(),
        );
        assert!(index.ensure_cached(tile).unwrap().exists());
        assert!(index.ensure_cached(SrtmTile::new(2, 2)).is_err());
        assert!(fetcher.requests.lock().is_empty());
    }
}
