//! Terrain analysis jobs.
//!
//! [`JobTracker::submit`] registers a job for an area of interest and runs
//! the [`Pipeline`] on a background thread: tiles are resolved and clipped,
//! derivatives fan out over a bounded pool, and the results are handed to a
//! [`Persistence`] store. [`JobTracker::poll`] returns the job's
//! [`JobStatus`] at any point until the entry expires.
//!
//! Terminal states:
//! - `succeeded`: everything computed and saved.
//! - `partially_succeeded`: some derivatives failed or timed out, the rest
//!   were saved.
//! - `failed`: acquisition failed (`failure = acquisition`) or the results
//!   could not be saved (`failure = persistence`).

pub mod config;
pub mod persistence;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod state;
pub mod tracker;

pub use config::{ConfigError, PipelineConfig, DATA_DIR_ENV};
pub use persistence::{AnalysisManifest, ManifestStore, PersistRequest, Persistence, PersistenceError};
pub use pipeline::{Pipeline, ELEVATION_ARTIFACT};
pub use registry::{JobRegistry, SubmitError};
pub use session::SessionLayout;
pub use state::{progress, FailureKind, JobOutcome, JobState, JobStatus};
pub use tracker::JobTracker;
