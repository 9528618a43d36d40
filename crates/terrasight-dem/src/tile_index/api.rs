//! Product-catalogue index for the USGS 3D Elevation Program.

use super::grid::TileFetcher;
use super::{RawTile, TileFormat, TileIndex, TileSet};
use crate::cache::{write_atomic, DownloadTracker};
use crate::crs::Crs;
use crate::geometry::{AreaOfInterest, BoundingBox};
use crate::raster::GeoTiffHeader;
use crate::source::ElevationSource;
use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use terrasight_metrics::{metric_defs, PipelineLabels};
use tracing::{debug, info, warn};

pub const DEFAULT_API_URL: &str = "https://tnmaccess.nationalmap.gov/api/v1/products";

/// Results requested per dataset query.
const QUERY_LIMIT: usize = 100;

/// Products larger than this are not single elevation tiles.
const MAX_PRODUCT_BYTES: u64 = 500 * 1024 * 1024;

/// Catalogue datasets in priority order, with the cache sub-directory for each.
pub const DATASETS: &[(&str, &str)] = &[
    ("Digital Elevation Model (DEM) 1 meter", "1m"),
    ("National Elevation Dataset (NED) 1/3 arc-second", "10m"),
    ("National Elevation Dataset (NED) 1 arc-second", "30m"),
];

/// Regions with 3DEP coverage: continental US, Alaska, Hawaii.
pub const COVERAGE: &[BoundingBox] = &[
    BoundingBox {
        min_x: -125.0,
        min_y: 24.0,
        max_x: -66.0,
        max_y: 49.0,
    },
    BoundingBox {
        min_x: -180.0,
        min_y: 52.0,
        max_x: -130.0,
        max_y: 72.0,
    },
    BoundingBox {
        min_x: -161.0,
        min_y: 18.0,
        max_x: -154.0,
        max_y: 23.0,
    },
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsgsOptions {
    pub cache_dir: PathBuf,
    pub api_url: String,
    /// Upper bound on products downloaded per AOI.
    pub max_products: usize,
    /// Cached products older than this are downloaded again.
    pub max_cache_age_days: u64,
}

impl Default for UsgsOptions {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data/usgs"),
            api_url: DEFAULT_API_URL.to_string(),
            max_products: 20,
            max_cache_age_days: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProductsResponse {
    #[serde(default)]
    items: Vec<Product>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Product {
    #[serde(default)]
    title: String,
    #[serde(rename = "downloadURL", default)]
    download_url: String,
    #[serde(default)]
    size_in_bytes: Option<u64>,
}

/// A catalogue hit chosen for download.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedProduct {
    pub title: String,
    pub url: String,
    /// Cache sub-directory of the dataset tier.
    pub tier: &'static str,
    /// Position of the tier in [`DATASETS`]; lower is finer.
    pub priority: usize,
}

impl SelectedProduct {
    /// File name taken from the URL path.
    pub fn file_name(&self) -> &str {
        let path = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        path.rsplit('/').next().unwrap_or(path)
    }
}

fn is_geotiff_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    path.ends_with(".tif") || path.ends_with(".tiff")
}

/// True when `bbox` touches any region the catalogue covers.
pub fn in_coverage(bbox: &BoundingBox) -> bool {
    COVERAGE.iter().any(|region| region.intersects(bbox))
}

pub struct UsgsIndex {
    options: UsgsOptions,
    fetcher: Arc<dyn TileFetcher>,
    downloads: DownloadTracker<PathBuf>,
}

impl UsgsIndex {
    pub fn new(options: UsgsOptions, fetcher: Arc<dyn TileFetcher>) -> Self {
        Self {
            options,
            fetcher,
            downloads: DownloadTracker::new(),
        }
    }

    fn query_url(&self, dataset: &str, bbox: &BoundingBox) -> Result<String> {
        let bbox_param = format!(
            "{},{},{},{}",
            bbox.min_x, bbox.min_y, bbox.max_x, bbox.max_y
        );
        let max = QUERY_LIMIT.to_string();
        let url = reqwest::Url::parse_with_params(
            &self.options.api_url,
            &[
                ("datasets", dataset),
                ("bbox", bbox_param.as_str()),
                ("max", max.as_str()),
                ("outputFormat", "JSON"),
            ],
        )
        .map_err(|e| DemError::Api(format!("bad API url {}: {}", self.options.api_url, e)))?;
        Ok(url.into())
    }

    /// Products covering `bbox` from the finest dataset tier that has any.
    ///
    /// Tiers are never mixed: a 1 m tile composited with a 1 arc-second one
    /// would force the whole mosaic down to 1 m cells. A tier whose query
    /// fails or comes back empty falls through to the next.
    pub fn query_products(&self, bbox: &BoundingBox) -> Vec<SelectedProduct> {
        for (priority, (dataset, tier)) in DATASETS.iter().enumerate() {
            let response = self
                .query_url(dataset, bbox)
                .and_then(|url| self.fetcher.fetch(&url))
                .and_then(|body| Ok(serde_json::from_slice::<ProductsResponse>(&body)?));
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(dataset, error = %e, "catalogue query failed");
                    continue;
                }
            };
            let mut products: Vec<SelectedProduct> = response
                .items
                .into_iter()
                .filter(|p| is_geotiff_url(&p.download_url))
                .filter(|p| p.size_in_bytes.map_or(true, |s| s <= MAX_PRODUCT_BYTES))
                .map(|p| SelectedProduct {
                    title: p.title,
                    url: p.download_url,
                    tier: *tier,
                    priority,
                })
                .collect();
            debug!(dataset, found = products.len(), "catalogue query");
            if !products.is_empty() {
                products.truncate(self.options.max_products);
                return products;
            }
        }
        Vec::new()
    }

    fn is_fresh(&self, path: &Path) -> bool {
        let max_age = Duration::from_secs(self.options.max_cache_age_days * 24 * 3600);
        std::fs::metadata(path)
            .ok()
            .filter(|m| m.len() > 0)
            .and_then(|m| m.modified().ok())
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age < max_age)
    }

    /// Download `product` unless a fresh copy is cached; returns the local path.
    pub fn ensure_cached(&self, product: &SelectedProduct) -> Result<PathBuf> {
        let labels = PipelineLabels::new(ElevationSource::Usgs3dep.id()).to_labels();
        let path = self
            .options
            .cache_dir
            .join(product.tier)
            .join(product.file_name());
        if self.is_fresh(&path) {
            metrics::counter!(metric_defs::TILE_CACHE_HITS.name, labels.as_slice()).increment(1);
            return Ok(path);
        }

        self.downloads
            .fetch(
                &path,
                || self.is_fresh(&path),
                || {
                    let bytes = self.fetcher.fetch(&product.url).map_err(|e| e.to_string())?;
                    write_atomic(&path, &bytes).map_err(|e| e.to_string())?;
                    info!(title = %product.title, bytes = bytes.len(), "downloaded USGS product");
                    metrics::counter!(metric_defs::TILES_DOWNLOADED.name, labels.as_slice())
                        .increment(1);
                    metrics::counter!(metric_defs::TILE_BYTES.name, labels.as_slice())
                        .increment(bytes.len() as u64);
                    Ok(bytes.len() as u64)
                },
            )
            .map_err(|reason| DemError::TileDownloadFailed {
                tile: product.title.clone(),
                reason,
            })?;
        Ok(path)
    }
}

impl TileIndex for UsgsIndex {
    fn source(&self) -> ElevationSource {
        ElevationSource::Usgs3dep
    }

    fn resolve(&self, aoi: &AreaOfInterest) -> Result<TileSet> {
        let bbox = aoi.bbox();
        let mut set = TileSet::default();
        if !in_coverage(&bbox) {
            info!(aoi = aoi.id(), "AOI is outside USGS 3DEP coverage");
            set.missing.push("outside USGS coverage".to_string());
            return Ok(set);
        }

        let products = self.query_products(&bbox);
        info!(aoi = aoi.id(), products = products.len(), "selected USGS products");

        for product in &products {
            let tile = self.ensure_cached(product).and_then(|path| {
                let header = GeoTiffHeader::read(&path, Crs::NAD83)?;
                Ok(RawTile {
                    bounds: header.bounds(),
                    crs: header.crs,
                    resolution: (header.transform.pixel_width, header.transform.pixel_height),
                    format: TileFormat::GeoTiff,
                    path,
                })
            });
            match tile {
                Ok(tile) => set.tiles.push(tile),
                Err(e) => {
                    warn!(title = %product.title, error = %e, "USGS product unavailable");
                    set.missing.push(product.title.clone());
                }
            }
        }
        Ok(set)
    }
}
