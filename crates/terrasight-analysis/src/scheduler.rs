//! Bounded fan-out of derivative computations.
//!
//! Derivatives are queued on a channel drained by a fixed pool of worker
//! threads. Each worker hands its derivative to the engine on a dedicated
//! thread and waits for the result with a timeout; on timeout the engine's
//! cancel token fires and the worker moves on without joining it. One
//! derivative failing or timing out never affects the others.

use crate::derivative::{Derivative, DEFAULT_CONTOUR_INTERVAL};
use crate::engine::{AnalysisEngine, CancelToken, DerivativeJob};
use crate::error::AnalysisError;
use crate::preview::{write_preview, ColorMap};
use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use terrasight_dem::{Footprint, Raster, WORKING_CRS};
use terrasight_metrics::{metric_defs, PipelineLabels};
use tracing::{debug, info, warn};

pub const MIN_WORKERS: usize = 4;
pub const MAX_WORKERS: usize = 6;
/// Longest per-derivative timeout accepted, one day.
pub const MAX_TIMEOUT_SECS: f64 = 86_400.0;
/// How long a timed-out engine gets to acknowledge cancellation.
pub const CANCEL_GRACE: Duration = Duration::from_millis(500);

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique sibling of `output` the engine writes to. Only a run that ends in
/// time is renamed onto `output`, so an engine that outlives its timeout can
/// never overwrite a later run's artifact.
fn staging_path(output: &Path) -> PathBuf {
    let stem = output.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let suffix = output
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    output.with_file_name(format!(
        ".{}.part-{}-{}{}",
        stem,
        std::process::id(),
        STAGING_COUNTER.fetch_add(1, Ordering::Relaxed),
        suffix
    ))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pool size, clamped to `MIN_WORKERS..=MAX_WORKERS`; sized from the
    /// host's parallelism when unset.
    pub workers: Option<usize>,
    /// Per-derivative timeout.
    pub timeout_secs: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            timeout_secs: 300.0,
        }
    }
}

impl SchedulerConfig {
    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(n) => n,
            None => thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(MIN_WORKERS),
        }
        .clamp(MIN_WORKERS, MAX_WORKERS)
    }

    /// Per-derivative timeout. Out-of-range or NaN values fall back to the
    /// nearest bound instead of panicking.
    pub fn timeout(&self) -> Duration {
        let secs = if self.timeout_secs.is_nan() {
            MAX_TIMEOUT_SECS
        } else {
            self.timeout_secs.clamp(0.0, MAX_TIMEOUT_SECS)
        };
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs(MAX_TIMEOUT_SECS as u64))
    }
}

/// How one derivative ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DerivativeOutcome {
    Succeeded {
        path: PathBuf,
        preview: PathBuf,
    },
    Failed {
        reason: String,
    },
    TimedOut {
        after_secs: f64,
    },
}

impl DerivativeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DerivativeOutcome::Succeeded { .. })
    }

    /// Human-readable reason for a non-success.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            DerivativeOutcome::Succeeded { .. } => None,
            DerivativeOutcome::Failed { reason } => Some(reason.clone()),
            DerivativeOutcome::TimedOut { after_secs } => {
                Some(format!("timed out after {:.0}s", after_secs))
            }
        }
    }
}

/// Inputs for one fan-out: the clipped elevation on disk and in memory,
/// plus the polygon used to mask previews.
#[derive(Debug, Clone)]
pub struct FanOutRequest {
    pub source_id: String,
    pub elevation_path: PathBuf,
    pub elevation: Arc<Raster>,
    pub footprint: Footprint,
    pub output_dir: PathBuf,
    pub derivatives: Vec<Derivative>,
    pub contour_interval: f64,
}

impl FanOutRequest {
    /// Every derivative, default contour interval, outputs next to the DEM.
    pub fn all(
        source_id: impl Into<String>,
        elevation_path: PathBuf,
        elevation: Arc<Raster>,
        footprint: Footprint,
    ) -> Self {
        let output_dir = elevation_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_default();
        Self {
            source_id: source_id.into(),
            elevation_path,
            elevation,
            footprint,
            output_dir,
            derivatives: Derivative::ALL.to_vec(),
            contour_interval: DEFAULT_CONTOUR_INTERVAL,
        }
    }
}

/// Aggregate of every derivative's outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanOutReport {
    pub outcomes: BTreeMap<Derivative, DerivativeOutcome>,
}

impl FanOutReport {
    /// Successful artifacts by name, previews included as `<name>_preview`.
    pub fn artifacts(&self) -> BTreeMap<String, PathBuf> {
        let mut out = BTreeMap::new();
        for (d, outcome) in &self.outcomes {
            if let DerivativeOutcome::Succeeded { path, preview } = outcome {
                out.insert(d.name().to_string(), path.clone());
                out.insert(format!("{}_preview", d.name()), preview.clone());
            }
        }
        out
    }

    /// Failed or timed-out derivatives with their reasons.
    pub fn failures(&self) -> BTreeMap<String, String> {
        self.outcomes
            .iter()
            .filter_map(|(d, o)| o.failure_reason().map(|r| (d.name().to_string(), r)))
            .collect()
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(DerivativeOutcome::is_success)
    }
}

pub struct FanOutScheduler {
    config: SchedulerConfig,
    engine: Arc<dyn AnalysisEngine>,
}

impl FanOutScheduler {
    pub fn new(config: SchedulerConfig, engine: Arc<dyn AnalysisEngine>) -> Self {
        Self { config, engine }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every requested derivative and wait for all of them.
    ///
    /// `on_outcome(derivative, outcome, finished, total)` is called on the
    /// calling thread as each derivative ends, in completion order.
    pub fn run<F>(&self, request: &FanOutRequest, mut on_outcome: F) -> FanOutReport
    where
        F: FnMut(Derivative, &DerivativeOutcome, usize, usize),
    {
        let total = request.derivatives.len();
        let mut report = FanOutReport::default();
        if total == 0 {
            return report;
        }
        if let Err(e) = std::fs::create_dir_all(&request.output_dir) {
            for d in &request.derivatives {
                report.outcomes.insert(
                    *d,
                    DerivativeOutcome::Failed {
                        reason: format!("cannot create {}: {}", request.output_dir.display(), e),
                    },
                );
            }
            return report;
        }

        let workers = self.config.worker_count().min(total);
        info!(derivatives = total, workers, "fanning out derivatives");

        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Derivative>();
        for d in &request.derivatives {
            // The receiver is alive in this scope.
            let _ = job_tx.send(*d);
        }
        drop(job_tx);
        let (result_tx, result_rx) = crossbeam_channel::unbounded();

        thread::scope(|scope| {
            for i in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("derivative-worker-{}", i))
                    .spawn_scoped(scope, move || {
                        while let Ok(derivative) = job_rx.recv() {
                            let outcome = self.run_one(request, derivative);
                            if result_tx.send((derivative, outcome)).is_err() {
                                break;
                            }
                        }
                    });
                if let Err(e) = spawned {
                    warn!(worker = i, error = %e, "failed to spawn derivative worker");
                }
            }
            drop(result_tx);

            let mut finished = 0;
            for (derivative, outcome) in result_rx.iter() {
                finished += 1;
                on_outcome(derivative, &outcome, finished, total);
                report.outcomes.insert(derivative, outcome);
            }
        });

        // Only reachable when no worker could be spawned at all.
        for d in &request.derivatives {
            report
                .outcomes
                .entry(*d)
                .or_insert_with(|| DerivativeOutcome::Failed {
                    reason: "no worker available".to_string(),
                });
        }

        info!(
            succeeded = report.success_count(),
            total,
            "derivative fan-out finished"
        );
        report
    }

    fn run_one(&self, request: &FanOutRequest, derivative: Derivative) -> DerivativeOutcome {
        let labels = PipelineLabels::new(&request.source_id)
            .with_derivative(derivative.name())
            .to_labels();
        let job = DerivativeJob {
            derivative,
            input: request.elevation_path.clone(),
            output: request.output_dir.join(derivative.file_name()),
            contour_interval: request.contour_interval,
        };
        let timeout = self.config.timeout();
        let cancel = CancelToken::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let started = Instant::now();

        let staging = staging_path(&job.output);
        let engine = Arc::clone(&self.engine);
        let engine_job = DerivativeJob {
            output: staging.clone(),
            ..job.clone()
        };
        let engine_cancel = cancel.clone();
        let spawned = thread::Builder::new()
            .name(format!("engine-{}", derivative))
            .spawn(move || {
                // The receiver is gone when the supervisor already timed out.
                let _ = tx.send(engine.run(&engine_job, &engine_cancel));
            });
        if let Err(e) = spawned {
            return DerivativeOutcome::Failed {
                reason: format!("failed to start engine thread: {}", e),
            };
        }

        let outcome = match rx.recv_timeout(timeout) {
            Ok(Ok(())) => match std::fs::rename(&staging, &job.output) {
                Ok(()) => match self.preview(request, derivative, &job.output) {
                    Ok(preview) => DerivativeOutcome::Succeeded {
                        path: job.output.clone(),
                        preview,
                    },
                    Err(e) => DerivativeOutcome::Failed {
                        reason: format!("preview failed: {}", e),
                    },
                },
                Err(e) => DerivativeOutcome::Failed {
                    reason: format!("cannot move output into place: {}", e),
                },
            },
            Ok(Err(e)) => DerivativeOutcome::Failed {
                reason: e.to_string(),
            },
            Err(RecvTimeoutError::Timeout) => {
                cancel.cancel();
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(CANCEL_GRACE) {
                    warn!(
                        derivative = %derivative,
                        staging = %staging.display(),
                        "engine ignored cancellation, leaving it running"
                    );
                }
                metrics::counter!(metric_defs::DERIVATIVE_TIMEOUTS.name, labels.as_slice())
                    .increment(1);
                DerivativeOutcome::TimedOut {
                    after_secs: timeout.as_secs_f64(),
                }
            }
            Err(RecvTimeoutError::Disconnected) => DerivativeOutcome::Failed {
                reason: "engine thread panicked".to_string(),
            },
        };

        if !outcome.is_success() {
            let _ = std::fs::remove_file(&staging);
        }

        let elapsed = started.elapsed().as_secs_f64();
        metrics::histogram!(metric_defs::DERIVATIVE_DURATION.name, labels.as_slice()).record(elapsed);
        match &outcome {
            DerivativeOutcome::Succeeded { path, .. } => {
                info!(derivative = %derivative, path = %path.display(), elapsed_s = elapsed, "derivative done");
            }
            other => {
                if let DerivativeOutcome::Failed { .. } = other {
                    metrics::counter!(metric_defs::DERIVATIVE_FAILURES.name, labels.as_slice())
                        .increment(1);
                }
                warn!(
                    derivative = %derivative,
                    reason = %other.failure_reason().unwrap_or_default(),
                    "derivative failed"
                );
            }
        }
        outcome
    }

    /// Render `<name>_preview.png`. Vector products are previewed over the
    /// elevation they came from.
    fn preview(
        &self,
        request: &FanOutRequest,
        derivative: Derivative,
        output: &Path,
    ) -> Result<PathBuf, AnalysisError> {
        let preview_path = request.output_dir.join(derivative.preview_file_name());
        if derivative.is_raster() {
            let raster = Raster::from_geotiff(output, WORKING_CRS)?;
            write_preview(&raster, &request.footprint, derivative.color_map(), &preview_path)?;
        } else {
            write_preview(
                &request.elevation,
                &request.footprint,
                ColorMap::Elevation,
                &preview_path,
            )?;
        }
        debug!(derivative = %derivative, path = %preview_path.display(), "wrote preview");
        Ok(preview_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count_bounds() {
        let auto = SchedulerConfig::default().worker_count();
        assert!((MIN_WORKERS..=MAX_WORKERS).contains(&auto));
        for (requested, expected) in [(0, MIN_WORKERS), (1, MIN_WORKERS), (5, 5), (64, MAX_WORKERS)] {
            let fixed = SchedulerConfig {
                workers: Some(requested),
                ..SchedulerConfig::default()
            };
            assert_eq!(fixed.worker_count(), expected, "workers: {}", requested);
        }
    }

    #[test]
    fn test_staging_path_keeps_extension() {
        let output = Path::new("/data/a/slope.tif");
        let first = staging_path(output);
        let second = staging_path(output);
        assert_ne!(first, second);
        assert_eq!(first.parent(), output.parent());
        assert_eq!(first.extension().unwrap(), "tif");
        let name = first.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".slope.part-"), "{}", name);
    }

    #[test]
    fn test_timeout_never_panics() {
        let with = |secs: f64| SchedulerConfig {
            timeout_secs: secs,
            ..SchedulerConfig::default()
        };
        assert_eq!(with(300.0).timeout(), Duration::from_secs(300));
        assert_eq!(with(0.25).timeout(), Duration::from_millis(250));
        assert_eq!(with(-5.0).timeout(), Duration::ZERO);
        let cap = Duration::from_secs(MAX_TIMEOUT_SECS as u64);
        assert_eq!(with(f64::INFINITY).timeout(), cap);
        assert_eq!(with(1e20).timeout(), cap);
        assert_eq!(with(f64::NAN).timeout(), cap);
    }

    #[test]
    fn test_report_partitions_outcomes() {
        let mut report = FanOutReport::default();
        report.outcomes.insert(
            Derivative::Slope,
            DerivativeOutcome::Succeeded {
                path: "s/slope.tif".into(),
                preview: "s/slope_preview.png".into(),
            },
        );
        report
            .outcomes
            .insert(Derivative::Aspect, DerivativeOutcome::TimedOut { after_secs: 300.0 });
        assert_eq!(report.success_count(), 1);
        assert!(!report.all_succeeded());
        assert_eq!(report.artifacts().len(), 2);
        assert_eq!(
            report.failures().get("aspect").map(String::as_str),
            Some("timed out after 300s")
        );
    }
}
