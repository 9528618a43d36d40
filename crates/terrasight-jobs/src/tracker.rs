//! Asynchronous job façade: `submit` returns immediately with a job id and
//! the job runs on its own thread; `poll` reads the latest status.

use crate::config::PipelineConfig;
use crate::persistence::{ManifestStore, Persistence};
use crate::pipeline::Pipeline;
use crate::registry::{JobRegistry, SubmitError};
use crate::state::{JobOutcome, JobStatus};
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use terrasight_analysis::{AnalysisEngine, CommandEngine};
use terrasight_dem::tile_index::{HttpFetcher, TileFetcher};
use terrasight_dem::{AreaOfInterest, ElevationSource};
use terrasight_metrics::{metric_defs, PipelineLabels};
use tracing::{debug, error, info, warn};

pub struct JobTracker {
    registry: Arc<JobRegistry>,
    pipeline: Arc<Pipeline>,
    reaper: Reaper,
}

impl JobTracker {
    pub fn new(
        config: PipelineConfig,
        engine: Arc<dyn AnalysisEngine>,
        fetcher: Arc<dyn TileFetcher>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(config.retention_secs)));
        let reaper = Reaper::start(
            Arc::clone(&registry),
            Duration::from_secs(config.reaper_interval_secs),
        );
        let pipeline = Arc::new(Pipeline::new(config, engine, fetcher, persistence));
        Self {
            registry,
            pipeline,
            reaper,
        }
    }

    /// Tracker with the production collaborators: the configured command
    /// engine, HTTP downloads (Earthdata credentials from the environment)
    /// and the manifest store.
    pub fn from_config(config: PipelineConfig) -> terrasight_dem::Result<Self> {
        let engine = Arc::new(CommandEngine::new(config.engine.clone()));
        let fetcher = Arc::new(HttpFetcher::from_env()?);
        Ok(Self::new(config, engine, fetcher, Arc::new(ManifestStore::new())))
    }

    /// Queue a job for `aoi` and start it in the background.
    ///
    /// Rejected with [`SubmitError::AlreadyRunning`] while another job for
    /// the same AOI id is queued or running.
    pub fn submit(&self, aoi: AreaOfInterest, source: ElevationSource) -> Result<String, SubmitError> {
        let labels = PipelineLabels::new(source.id()).to_labels();
        let job_id = match self.registry.create(aoi.id(), source) {
            Ok(id) => id,
            Err(e) => {
                metrics::counter!(metric_defs::JOBS_REJECTED.name, labels.as_slice()).increment(1);
                warn!(aoi = aoi.id(), error = %e, "submission rejected");
                return Err(e);
            }
        };
        metrics::counter!(metric_defs::JOBS_SUBMITTED.name, labels.as_slice()).increment(1);
        info!(job_id = %job_id, aoi = aoi.id(), source = %source, "job queued");

        let registry = Arc::clone(&self.registry);
        let pipeline = Arc::clone(&self.pipeline);
        let id = job_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{}", job_id))
            .spawn(move || run_job(&registry, &pipeline, &id, &aoi, source));
        if let Err(e) = spawned {
            error!(job_id = %job_id, error = %e, "failed to start job thread");
            self.registry
                .finish(&job_id, JobOutcome::acquisition_failed(format!("job not started: {}", e)));
            return Err(SubmitError::Spawn(e));
        }
        Ok(job_id)
    }

    /// Latest status, or `None` for unknown or reclaimed jobs.
    pub fn poll(&self, job_id: &str) -> Option<JobStatus> {
        self.registry.get(job_id)
    }

    /// Block until the job is terminal or `timeout` elapses.
    pub fn wait(&self, job_id: &str, timeout: Duration) -> Option<JobStatus> {
        self.registry.wait(job_id, timeout)
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl Drop for JobTracker {
    fn drop(&mut self) {
        self.reaper.stop();
    }
}

fn run_job(
    registry: &JobRegistry,
    pipeline: &Pipeline,
    job_id: &str,
    aoi: &AreaOfInterest,
    source: ElevationSource,
) {
    let labels = PipelineLabels::new(source.id());
    let label_vec = labels.to_labels();
    metrics::gauge!(metric_defs::JOBS_ACTIVE.name, label_vec.as_slice()).increment(1.0);
    let started = Instant::now();
    registry.start(job_id);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        pipeline.run(job_id, aoi, source, |value, message| {
            debug!(job_id, progress = value, %message, "progress");
            registry.update_progress(job_id, value, message);
        })
    }))
    .unwrap_or_else(|_| {
        error!(job_id, "job panicked");
        JobOutcome::internal_error("internal error: job panicked")
    });

    let elapsed = started.elapsed().as_secs_f64();
    metrics::gauge!(metric_defs::JOBS_ACTIVE.name, label_vec.as_slice()).decrement(1.0);
    metrics::histogram!(metric_defs::JOB_DURATION.name, label_vec.as_slice()).record(elapsed);
    match &outcome {
        JobOutcome::Succeeded { artifacts } => {
            metrics::counter!(metric_defs::JOBS_SUCCEEDED.name, label_vec.as_slice()).increment(1);
            info!(job_id, artifacts = artifacts.len(), elapsed_s = elapsed, "job succeeded");
        }
        JobOutcome::PartiallySucceeded { failed, .. } => {
            metrics::counter!(metric_defs::JOBS_PARTIAL.name, label_vec.as_slice()).increment(1);
            warn!(job_id, failed = failed.len(), elapsed_s = elapsed, "job partially succeeded");
        }
        JobOutcome::Failed { kind, message, .. } => {
            let failed_labels = labels.with(&[("failure", kind.as_str().to_string())]);
            metrics::counter!(metric_defs::JOBS_FAILED.name, failed_labels.as_slice()).increment(1);
            warn!(job_id, failure = kind.as_str(), %message, "job failed");
        }
    }
    registry.finish(job_id, outcome);
}

/// Background thread reclaiming expired jobs.
struct Reaper {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    fn start(registry: Arc<JobRegistry>, interval: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("job-reaper".to_string())
            .spawn(move || {
                let (lock, cvar) = &*signal;
                let mut stopped = lock.lock();
                while !*stopped {
                    cvar.wait_for(&mut stopped, interval);
                    if !*stopped {
                        registry.reclaim_expired(Utc::now());
                    }
                }
            });
        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                // Jobs still work; they are just never reclaimed.
                warn!(error = %e, "failed to start job reaper");
                None
            }
        };
        Self { stop, handle }
    }

    fn stop(&mut self) {
        let (lock, cvar) = &*self.stop;
        *lock.lock() = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
