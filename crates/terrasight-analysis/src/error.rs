//! Error types for derivative computation.

use std::path::PathBuf;
use terrasight_dem::DemError;
use thiserror::Error;

/// Failures of a single analysis-engine invocation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No command template is configured for the derivative.
    #[error("no command configured for '{0}'")]
    NotConfigured(String),

    /// The tool could not be started.
    #[error("failed to start '{program}': {source}")]
    Spawn {
        /// Executable name.
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool exited unsuccessfully.
    #[error("'{program}' exited with {status}: {detail}")]
    ExitStatus {
        /// Executable name.
        program: String,
        /// Exit status as reported by the OS.
        status: String,
        /// Tail of the tool's stderr log.
        detail: String,
    },

    /// The tool reported success but left no output behind.
    #[error("engine produced no output at {0}")]
    MissingOutput(PathBuf),

    /// The invocation was killed after its cancel token fired.
    #[error("cancelled")]
    Cancelled,

    /// I/O error while supervising the tool.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from preview rendering and statistics.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Raster I/O failed.
    #[error(transparent)]
    Dem(#[from] DemError),

    /// PNG encoding failed.
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// The raster holds no valid pixels to summarise or colour.
    #[error("raster has no valid pixels")]
    NoValidPixels,
}

/// Result type for analysis operations.
pub type Result<T> = std::result::Result<T, AnalysisError>;
