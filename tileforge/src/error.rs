//! Pipeline-wide error classification.
//!
//! Two tiers: [`FeatureError`] covers per-feature failures that are logged,
//! counted, and swallowed so one bad record cannot abort a run, while
//! [`PipelineError`] covers run-fatal conditions that cancel all stages.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal, run-aborting errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid configuration value; reported before any work begins.
    #[error("invalid argument '{key}': {reason}")]
    BadArgument { key: String, reason: String },

    /// A required input file does not exist.
    #[error("input not found: {0}")]
    MissingInput(PathBuf),

    /// I/O failure on a temp or output file.
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The scratch or output volume ran out of space.
    #[error("out of disk space writing {0}")]
    OutOfDisk(PathBuf),

    /// Source data could not be parsed at the start of a stream.
    #[error("unreadable source {path}: {message}")]
    SourceParse { path: PathBuf, message: String },

    /// SQLite-level failure in the MBTiles writer.
    #[error("mbtiles error: {0}")]
    Mbtiles(#[from] rusqlite::Error),

    /// The run was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation inside the engine.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Wraps an I/O error, promoting ENOSPC to its own kind so the caller
    /// can report a disk-full condition distinctly.
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.raw_os_error() == Some(libc_enospc()) {
            PipelineError::OutOfDisk(path)
        } else {
            PipelineError::Io { path, source }
        }
    }

    /// True when the error came from the cancel signal rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

#[cfg(unix)]
fn libc_enospc() -> i32 {
    28 // ENOSPC
}

#[cfg(not(unix))]
fn libc_enospc() -> i32 {
    i32::MIN // never matches; disk-full detection is best-effort off unix
}

/// Per-feature failures. Recorded in [`crate::stats::Stats`], never fatal.
#[derive(Debug, Error)]
pub enum FeatureError {
    /// Geometry could not be built or became degenerate.
    #[error("invalid geometry for {kind} {id}: {message}")]
    GeometryInvalid {
        kind: &'static str,
        id: u64,
        message: String,
    },

    /// The profile rejected the feature.
    #[error("profile rejected {kind} {id}")]
    ProfileRejected { kind: &'static str, id: u64 },

    /// A way or relation referenced a node absent from pass-1.
    #[error("way {way} references missing node {node}")]
    MissingNodeReference { way: u64, node: u64 },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
