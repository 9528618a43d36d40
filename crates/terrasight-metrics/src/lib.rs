//! Metric declarations for the terrasight pipeline.
//!
//! Every metric emitted by the pipeline crates is declared here as a const
//! [`Metric`], so names live in one place and exporters can be given
//! descriptions and units up front via [`describe_metrics`].
//!
//! ```rust
//! use terrasight_metrics::{metric_defs, PipelineLabels};
//!
//! let labels = PipelineLabels::new("srtm").with_derivative("slope");
//! metrics::counter!(metric_defs::DERIVATIVE_TIMEOUTS.name, labels.to_labels().as_slice()).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

impl MetricKind {
    /// Returns the kind as a lowercase string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration: name, kind, description, unit and expected label keys.
///
/// Built with the const constructors so declarations can live in `static`
/// tables.
///
/// ```rust
/// use terrasight_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const TILES: Metric = Metric::counter("terrasight.tiles.fetched")
///     .with_description("Tiles fetched")
///     .with_unit(Unit::Count)
///     .with_labels(&["source"]);
///
/// assert_eq!(TILES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "terrasight.jobs.submitted").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn new(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Declares a counter.
    pub const fn counter(name: &'static str) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    /// Declares a gauge.
    pub const fn gauge(name: &'static str) -> Self {
        Self::new(name, MetricKind::Gauge)
    }

    /// Declares a histogram.
    pub const fn histogram(name: &'static str) -> Self {
        Self::new(name, MetricKind::Histogram)
    }

    /// Sets the description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => describe_counter!(self.name, unit, self.description),
            (MetricKind::Counter, None) => describe_counter!(self.name, self.description),
            (MetricKind::Gauge, Some(unit)) => describe_gauge!(self.name, unit, self.description),
            (MetricKind::Gauge, None) => describe_gauge!(self.name, self.description),
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description)
            }
            (MetricKind::Histogram, None) => describe_histogram!(self.name, self.description),
        }
    }
}

/// All metric definitions for the pipeline.
pub mod metric_defs {
    use super::{Metric, Unit};

    /// Labels carried by every job-scoped metric.
    pub const JOB_LABELS: &[&str] = &["source"];

    /// Labels carried by derivative metrics.
    pub const DERIVATIVE_LABELS: &[&str] = &["source", "derivative"];

    // ========================================================================
    // Jobs
    // ========================================================================

    /// Jobs accepted by the tracker.
    pub const JOBS_SUBMITTED: Metric = Metric::counter("terrasight.jobs.submitted")
        .with_description("Jobs accepted by the tracker")
        .with_unit(Unit::Count)
        .with_labels(JOB_LABELS);

    /// Submissions rejected because the AOI already had a job in flight.
    pub const JOBS_REJECTED: Metric = Metric::counter("terrasight.jobs.rejected")
        .with_description("Submissions rejected because the AOI already had a running job")
        .with_unit(Unit::Count)
        .with_labels(JOB_LABELS);

    /// Jobs finishing in the succeeded state.
    pub const JOBS_SUCCEEDED: Metric = Metric::counter("terrasight.jobs.succeeded")
        .with_description("Jobs that finished with every artifact persisted")
        .with_unit(Unit::Count)
        .with_labels(JOB_LABELS);

    /// Jobs finishing in the partially-succeeded state.
    pub const JOBS_PARTIAL: Metric = Metric::counter("terrasight.jobs.partially_succeeded")
        .with_description("Jobs that persisted a partial derivative set")
        .with_unit(Unit::Count)
        .with_labels(JOB_LABELS);

    /// Jobs finishing in the failed state.
    ///
    /// Labels: source, failure (acquisition | persistence)
    pub const JOBS_FAILED: Metric = Metric::counter("terrasight.jobs.failed")
        .with_description("Jobs that failed during acquisition or persistence")
        .with_unit(Unit::Count)
        .with_labels(&["source", "failure"]);

    /// Jobs currently running.
    pub const JOBS_ACTIVE: Metric = Metric::gauge("terrasight.jobs.active")
        .with_description("Jobs currently running")
        .with_unit(Unit::Count);

    /// Wall-clock duration of a whole job.
    pub const JOB_DURATION: Metric = Metric::histogram("terrasight.jobs.duration_s")
        .with_description("Wall-clock duration of a job from start to terminal state")
        .with_unit(Unit::Seconds)
        .with_labels(JOB_LABELS);

    // ========================================================================
    // Acquisition
    // ========================================================================

    /// Tiles downloaded from a remote mirror or API.
    pub const TILES_DOWNLOADED: Metric = Metric::counter("terrasight.tiles.downloaded")
        .with_description("Tiles downloaded from a remote mirror or API")
        .with_unit(Unit::Count)
        .with_labels(JOB_LABELS);

    /// Bytes downloaded for tiles.
    pub const TILE_BYTES: Metric = Metric::counter("terrasight.tiles.bytes")
        .with_description("Bytes downloaded for tiles")
        .with_unit(Unit::Bytes)
        .with_labels(JOB_LABELS);

    /// Tiles served from the local cache.
    pub const TILE_CACHE_HITS: Metric = Metric::counter("terrasight.tiles.cache_hits")
        .with_description("Tiles served from the local cache")
        .with_unit(Unit::Count)
        .with_labels(JOB_LABELS);

    /// Individual mirror attempts that failed.
    pub const MIRROR_FAILURES: Metric = Metric::counter("terrasight.tiles.mirror_failures")
        .with_description("Download attempts against a single mirror that failed")
        .with_unit(Unit::Count)
        .with_labels(JOB_LABELS);

    /// Archive files rejected by the bounding-box prefilter.
    pub const ARCHIVE_BBOX_REJECTED: Metric = Metric::counter("terrasight.archive.bbox_rejected")
        .with_description("Archive files rejected by the bounding-box prefilter")
        .with_unit(Unit::Count);

    // ========================================================================
    // Derivatives
    // ========================================================================

    /// Time spent computing a single derivative.
    pub const DERIVATIVE_DURATION: Metric = Metric::histogram("terrasight.derivative.duration_s")
        .with_description("Time spent computing a single derivative")
        .with_unit(Unit::Seconds)
        .with_labels(DERIVATIVE_LABELS);

    /// Derivatives that failed.
    pub const DERIVATIVE_FAILURES: Metric = Metric::counter("terrasight.derivative.failures")
        .with_description("Derivatives whose engine invocation or preview failed")
        .with_unit(Unit::Count)
        .with_labels(DERIVATIVE_LABELS);

    /// Derivatives cancelled after exceeding their timeout.
    pub const DERIVATIVE_TIMEOUTS: Metric = Metric::counter("terrasight.derivative.timeouts")
        .with_description("Derivatives cancelled after exceeding their timeout")
        .with_unit(Unit::Count)
        .with_labels(DERIVATIVE_LABELS);

    /// Returns a slice of all defined metrics.
    pub const ALL: &[&Metric] = &[
        // Jobs
        &JOBS_SUBMITTED,
        &JOBS_REJECTED,
        &JOBS_SUCCEEDED,
        &JOBS_PARTIAL,
        &JOBS_FAILED,
        &JOBS_ACTIVE,
        &JOB_DURATION,
        // Acquisition
        &TILES_DOWNLOADED,
        &TILE_BYTES,
        &TILE_CACHE_HITS,
        &MIRROR_FAILURES,
        &ARCHIVE_BBOX_REJECTED,
        // Derivatives
        &DERIVATIVE_DURATION,
        &DERIVATIVE_FAILURES,
        &DERIVATIVE_TIMEOUTS,
    ];
}

/// Labels identifying the elevation source and, for derivative metrics, the
/// derivative name.
#[derive(Debug, Clone)]
pub struct PipelineLabels {
    /// Elevation source id (`srtm`, `lidar`, `usgs-dem`).
    pub source: String,
    /// Derivative name, for derivative-scoped metrics.
    pub derivative: Option<String>,
}

impl PipelineLabels {
    /// Labels for a job against `source`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            derivative: None,
        }
    }

    /// Adds the derivative label.
    pub fn with_derivative(mut self, derivative: impl Into<String>) -> Self {
        self.derivative = Some(derivative.into());
        self
    }

    /// Converts to the `metrics` crate label format.
    pub fn to_labels(&self) -> Vec<(&'static str, String)> {
        let mut labels = vec![("source", self.source.clone())];
        if let Some(derivative) = &self.derivative {
            labels.push(("derivative", derivative.clone()));
        }
        labels
    }

    /// Returns labels with additional key-value pairs.
    pub fn with(&self, extra: &[(&'static str, String)]) -> Vec<(&'static str, String)> {
        let mut labels = self.to_labels();
        labels.extend_from_slice(extra);
        labels
    }
}

/// Registers descriptions for every metric in [`metric_defs::ALL`].
///
/// Call once at startup, after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

/// Installs a Prometheus recorder serving `/metrics` on `addr`.
#[cfg(feature = "prometheus")]
pub fn install_prometheus(
    addr: std::net::SocketAddr,
) -> Result<(), metrics_exporter_prometheus::BuildError> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}
