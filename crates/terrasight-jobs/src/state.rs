//! Job states, failure kinds and the pollable status record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use terrasight_dem::ElevationSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    PartiallySucceeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::PartiallySucceeded | JobState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::PartiallySucceeded => "partially_succeeded",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job ended in [`JobState::Failed`].
///
/// `Persistence` means every computation finished but the results could not
/// be stored; the artifacts may still be on disk. `Internal` means the job
/// itself panicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Acquisition,
    Persistence,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Acquisition => "acquisition",
            FailureKind::Persistence => "persistence",
            FailureKind::Internal => "internal",
        }
    }
}

/// Progress milestones, in percent.
pub mod progress {
    pub const QUEUED: u8 = 0;
    pub const ACQUISITION_STARTED: u8 = 5;
    pub const TILES_RESOLVED: u8 = 20;
    pub const TILES_LOADED: u8 = 25;
    pub const MOSAICKED: u8 = 35;
    pub const NORMALIZED: u8 = 40;
    pub const CLIPPED: u8 = 45;
    pub const DERIVATIVES_STARTED: u8 = 50;
    pub const DERIVATIVES_DONE: u8 = 90;
    pub const PERSISTING: u8 = 92;
    pub const COMPLETE: u8 = 100;

    /// Linear share of the derivative band for `done` of `total` finished.
    pub fn derivatives(done: usize, total: usize) -> u8 {
        if total == 0 {
            return DERIVATIVES_DONE;
        }
        let span = (DERIVATIVES_DONE - DERIVATIVES_STARTED) as usize;
        DERIVATIVES_STARTED + (span * done.min(total) / total) as u8
    }
}

/// Snapshot of a job as seen by pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub aoi_id: String,
    pub source: ElevationSource,
    pub state: JobState,
    /// 0..=100, never decreasing.
    pub progress: u8,
    pub message: String,
    pub failure: Option<FailureKind>,
    pub artifacts: BTreeMap<String, PathBuf>,
    pub failed_derivatives: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatus {
    pub(crate) fn new(job_id: String, aoi_id: String, source: ElevationSource) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            aoi_id,
            source,
            state: JobState::Queued,
            progress: progress::QUEUED,
            message: "queued".to_string(),
            failure: None,
            artifacts: BTreeMap::new(),
            failed_derivatives: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// How a job ended, as reported by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded {
        artifacts: BTreeMap<String, PathBuf>,
    },
    PartiallySucceeded {
        artifacts: BTreeMap<String, PathBuf>,
        failed: BTreeMap<String, String>,
    },
    Failed {
        kind: FailureKind,
        message: String,
        /// Products that were computed before the failure.
        artifacts: BTreeMap<String, PathBuf>,
        failed: BTreeMap<String, String>,
    },
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Succeeded { .. } => JobState::Succeeded,
            JobOutcome::PartiallySucceeded { .. } => JobState::PartiallySucceeded,
            JobOutcome::Failed { .. } => JobState::Failed,
        }
    }

    pub(crate) fn acquisition_failed(message: impl Into<String>) -> Self {
        Self::failed(FailureKind::Acquisition, message)
    }

    pub(crate) fn internal_error(message: impl Into<String>) -> Self {
        Self::failed(FailureKind::Internal, message)
    }

    fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        JobOutcome::Failed {
            kind,
            message: message.into(),
            artifacts: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }
}
