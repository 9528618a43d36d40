//! Terrain derivatives around an external analysis engine.
//!
//! - [`derivative`] names the fixed product set and its file layout.
//! - [`engine`] is the seam to the tool that actually computes slope,
//!   hillshade and the rest, with best-effort cancellation.
//! - [`scheduler`] fans the products out over a bounded worker pool with a
//!   per-derivative timeout and aggregates the outcomes.
//! - [`preview`] renders masked PNG previews and [`stats`] summarises the
//!   terrain.

pub mod derivative;
pub mod engine;
pub mod error;
pub mod preview;
pub mod scheduler;
pub mod stats;

pub use derivative::{Derivative, DEFAULT_CONTOUR_INTERVAL};
pub use engine::{AnalysisEngine, CancelToken, CommandEngine, DerivativeJob, EngineConfig};
pub use error::{AnalysisError, EngineError, Result};
pub use preview::{render_preview, write_preview, ColorMap};
pub use scheduler::{DerivativeOutcome, FanOutReport, FanOutRequest, FanOutScheduler, SchedulerConfig};
pub use stats::{compute_statistics, TerrainStatistics};
