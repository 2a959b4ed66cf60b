// Failure taxonomy for a single resolve() call.
//
// Every variant is Clone so one deduplicated computation can hand the same
// outcome to all of its waiters.

use std::fmt;
use std::path::PathBuf;

use crate::engine::key::Dimensions;

/// Why a URL could not be turned into a cache key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("url has no file extension: {0}")]
    MissingExtension(String),
    #[error("unsupported file extension '{0}'")]
    BadExtension(String),
}

/// Download failures. Never retried by the fetcher itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("request failed: {0}")]
    Network(String),
    #[error("download timed out")]
    Timeout,
    #[error("writing download failed: {0}")]
    Io(String),
}

/// The two external transform stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Upscale,
    Resize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Upscale => f.write_str("upscale"),
            Stage::Resize => f.write_str("resize"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransformError {
    /// Non-zero exit, or the tool exited cleanly without writing its output.
    #[error("{stage} failed ({status}): {diagnostics}")]
    Failed {
        stage: Stage,
        status: String,
        diagnostics: String,
    },
    #[error("{stage} timed out")]
    Timeout { stage: Stage },
    #[error("{stage} could not run: {reason}")]
    Io { stage: Stage, reason: String },
}

impl TransformError {
    pub fn stage(&self) -> Stage {
        match self {
            TransformError::Failed { stage, .. }
            | TransformError::Timeout { stage }
            | TransformError::Io { stage, .. } => *stage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cache write to {path} failed: {reason}")]
pub struct StoreError {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cache read of {path} failed: {reason}")]
pub struct ReadError {
    pub path: PathBuf,
    pub reason: String,
    /// The file was gone rather than unreadable.
    pub not_found: bool,
}

/// Terminal outcome of a failed resolve().
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] KeyError),
    #[error("fetching {url} failed: {source}")]
    FetchFailed { url: String, source: FetchError },
    #[error("transforming to {dims} failed: {source}")]
    TransformFailed {
        dims: Dimensions,
        source: TransformError,
    },
    #[error(transparent)]
    StorageFailed(#[from] StoreError),
    #[error(transparent)]
    ReadFailed(#[from] ReadError),
}

impl ResolveError {
    /// Short stage label for logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::InvalidInput(_) => "invalid_input",
            ResolveError::FetchFailed { .. } => "fetch",
            ResolveError::TransformFailed { .. } => "transform",
            ResolveError::StorageFailed(_) => "storage",
            ResolveError::ReadFailed(_) => "read",
        }
    }
}
