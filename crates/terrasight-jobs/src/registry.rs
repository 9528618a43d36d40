//! The job table shared by submitters, pollers and job threads.
//!
//! Lifecycle: an entry is created on submit, read on poll, advanced by its
//! job thread and removed by [`JobRegistry::reclaim_expired`] once it is
//! terminal and older than the retention window. A per-AOI index enforces
//! at most one in-flight job per AOI id.

use crate::state::{progress, JobOutcome, JobState, JobStatus};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use terrasight_dem::ElevationSource;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SubmitError {
    /// A job for this AOI is still queued or running.
    #[error("AOI already has job {job_id} in flight")]
    AlreadyRunning {
        /// The job that is in flight.
        job_id: String,
    },

    /// AOI ids become directory names, so only a safe subset is accepted.
    #[error("invalid AOI id '{0}': use letters, digits, '-', '_' or '.'")]
    InvalidAoiId(String),

    /// The job thread could not be started.
    #[error("failed to start job thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobStatus>,
    /// AOI id -> job id of its queued or running job.
    in_flight: HashMap<String, String>,
    next_seq: u64,
}

pub struct JobRegistry {
    inner: Mutex<Inner>,
    changed: Condvar,
    retention: Duration,
}

pub fn is_valid_aoi_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl JobRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            changed: Condvar::new(),
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Register a queued job, or reject it when the AOI already has one in
    /// flight. The check and the insert happen under one lock.
    pub fn create(&self, aoi_id: &str, source: ElevationSource) -> Result<String, SubmitError> {
        if !is_valid_aoi_id(aoi_id) {
            return Err(SubmitError::InvalidAoiId(aoi_id.to_string()));
        }
        let mut inner = self.inner.lock();
        if let Some(job_id) = inner.in_flight.get(aoi_id) {
            return Err(SubmitError::AlreadyRunning {
                job_id: job_id.clone(),
            });
        }
        inner.next_seq += 1;
        let job_id = format!("{}-{}", aoi_id, inner.next_seq);
        inner
            .in_flight
            .insert(aoi_id.to_string(), job_id.clone());
        inner.jobs.insert(
            job_id.clone(),
            JobStatus::new(job_id.clone(), aoi_id.to_string(), source),
        );
        Ok(job_id)
    }

    /// queued -> running.
    pub fn start(&self, job_id: &str) {
        self.modify(job_id, |status| {
            if status.state == JobState::Queued {
                status.state = JobState::Running;
                status.progress = progress::QUEUED;
                status.message = "started".to_string();
                true
            } else {
                false
            }
        });
    }

    /// Record progress on a running job.
    ///
    /// Values below the current progress are ignored, as is anything sent to
    /// a job that is not running. Returns whether the status changed.
    pub fn update_progress(&self, job_id: &str, value: u8, message: impl Into<String>) -> bool {
        let value = value.min(progress::COMPLETE);
        let message = message.into();
        self.modify(job_id, |status| {
            if status.state != JobState::Running || value < status.progress {
                return false;
            }
            status.progress = value;
            status.message = message;
            true
        })
    }

    /// Move a job into its terminal state and release its AOI.
    ///
    /// Terminal states never change afterwards. A failed job keeps the
    /// progress it had reached.
    pub fn finish(&self, job_id: &str, outcome: JobOutcome) -> bool {
        let mut inner = self.inner.lock();
        let Some(status) = inner.jobs.get_mut(job_id) else {
            return false;
        };
        if status.state.is_terminal() {
            return false;
        }
        status.state = outcome.state();
        match outcome {
            JobOutcome::Succeeded { artifacts } => {
                status.progress = progress::COMPLETE;
                status.message = format!("completed: {} artifacts", artifacts.len());
                status.artifacts = artifacts;
            }
            JobOutcome::PartiallySucceeded { artifacts, failed } => {
                status.progress = progress::COMPLETE;
                status.message = format!(
                    "completed with {} failed derivative(s): {}",
                    failed.len(),
                    failed.keys().cloned().collect::<Vec<_>>().join(", ")
                );
                status.artifacts = artifacts;
                status.failed_derivatives = failed;
            }
            JobOutcome::Failed {
                kind,
                message,
                artifacts,
                failed,
            } => {
                status.failure = Some(kind);
                status.message = message;
                status.artifacts = artifacts;
                status.failed_derivatives = failed;
            }
        }
        status.updated_at = Utc::now();
        let aoi_id = status.aoi_id.clone();
        if inner.in_flight.get(&aoi_id).map(String::as_str) == Some(job_id) {
            inner.in_flight.remove(&aoi_id);
        }
        drop(inner);
        self.changed.notify_all();
        true
    }

    pub fn get(&self, job_id: &str) -> Option<JobStatus> {
        self.inner.lock().jobs.get(job_id).cloned()
    }

    /// Job currently queued or running for an AOI.
    pub fn in_flight(&self, aoi_id: &str) -> Option<String> {
        self.inner.lock().in_flight.get(aoi_id).cloned()
    }

    /// Block until the job is terminal or `timeout` elapses; returns the
    /// latest status either way, `None` for unknown ids.
    pub fn wait(&self, job_id: &str, timeout: Duration) -> Option<JobStatus> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            let status = inner.jobs.get(job_id)?;
            if status.state.is_terminal() {
                return Some(status.clone());
            }
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.jobs.get(job_id).cloned();
            }
        }
    }

    /// Drop terminal jobs created more than the retention window before
    /// `now`. Returns how many were removed.
    pub fn reclaim_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner
            .jobs
            .retain(|_, s| !(s.state.is_terminal() && now - s.created_at >= retention));
        let removed = before - inner.jobs.len();
        if removed > 0 {
            debug!(removed, remaining = inner.jobs.len(), "reclaimed expired jobs");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn modify<F>(&self, job_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut JobStatus) -> bool,
    {
        let changed = {
            let mut inner = self.inner.lock();
            match inner.jobs.get_mut(job_id) {
                Some(status) => {
                    let changed = f(status);
                    if changed {
                        status.updated_at = Utc::now();
                    }
                    changed
                }
                None => false,
            }
        };
        if changed {
            self.changed.notify_all();
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FailureKind;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::thread;

    fn registry() -> JobRegistry {
        JobRegistry::new(Duration::from_secs(3600))
    }

    #[test]
    fn test_job_ids_and_duplicate_rejection() {
        let reg = registry();
        let first = reg.create("field-7", ElevationSource::Srtm).unwrap();
        assert_eq!(first, "field-7-1");
        match reg.create("field-7", ElevationSource::Srtm) {
            Err(SubmitError::AlreadyRunning { job_id }) => assert_eq!(job_id, first),
            other => panic!("expected rejection, got {:?}", other),
        }
        // Other AOIs are unaffected.
        assert_eq!(reg.create("field-8", ElevationSource::Srtm).unwrap(), "field-8-2");

        // Once terminal, the AOI can be submitted again.
        reg.start(&first);
        reg.finish(&first, JobOutcome::Succeeded { artifacts: BTreeMap::new() });
        assert_eq!(reg.create("field-7", ElevationSource::Srtm).unwrap(), "field-7-3");
    }

    #[test]
    fn test_invalid_aoi_ids() {
        let reg = registry();
        for bad in ["", "..", "a/b", "a b", "x\\y"] {
            assert!(matches!(
                reg.create(bad, ElevationSource::Srtm),
                Err(SubmitError::InvalidAoiId(_))
            ));
        }
        assert!(is_valid_aoi_id("Lot_12.v2-a"));
    }

    #[test]
    fn test_progress_is_monotonic_and_running_only() {
        let reg = registry();
        let id = reg.create("a", ElevationSource::Srtm).unwrap();
        assert!(!reg.update_progress(&id, 10, "too early"));
        reg.start(&id);
        assert!(reg.update_progress(&id, 20, "tiles"));
        assert!(!reg.update_progress(&id, 10, "backwards"));
        let status = reg.get(&id).unwrap();
        assert_eq!(status.progress, 20);
        assert_eq!(status.message, "tiles");
    }

    #[test]
    fn test_failed_freezes_progress_and_terminal_is_immutable() {
        let reg = registry();
        let id = reg.create("a", ElevationSource::Srtm).unwrap();
        reg.start(&id);
        reg.update_progress(&id, 20, "tiles");
        assert!(reg.finish(&id, JobOutcome::acquisition_failed("no tiles")));

        let status = reg.get(&id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.failure, Some(FailureKind::Acquisition));
        assert_eq!(status.progress, 20);

        assert!(!reg.finish(&id, JobOutcome::Succeeded { artifacts: BTreeMap::new() }));
        assert!(!reg.update_progress(&id, 90, "late"));
        assert_eq!(reg.get(&id).unwrap(), status);
    }

    #[test]
    fn test_reclaim_only_expired_terminal_jobs() {
        let reg = registry();
        let done = reg.create("a", ElevationSource::Srtm).unwrap();
        let running = reg.create("b", ElevationSource::Srtm).unwrap();
        reg.start(&done);
        reg.start(&running);
        reg.finish(&done, JobOutcome::Succeeded { artifacts: BTreeMap::new() });

        assert_eq!(reg.reclaim_expired(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::seconds(3601);
        assert_eq!(reg.reclaim_expired(later), 1);
        assert!(reg.get(&done).is_none());
        assert!(reg.get(&running).is_some());
    }

    #[test]
    fn test_wait_wakes_on_finish() {
        let reg = Arc::new(registry());
        let id = reg.create("a", ElevationSource::Srtm).unwrap();
        reg.start(&id);

        let finisher = {
            let reg = Arc::clone(&reg);
            let id = id.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                reg.finish(&id, JobOutcome::Succeeded { artifacts: BTreeMap::new() });
            })
        };
        let status = reg.wait(&id, Duration::from_secs(5)).unwrap();
        finisher.join().unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.progress, 100);

        assert!(reg.wait("nope", Duration::from_millis(10)).is_none());
    }
}
