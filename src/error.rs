use std::path::{Path, PathBuf};

use thiserror::Error;

/// Error type for every maintenance operation.
#[derive(Debug, Error)]
pub enum MaintError {
    /// Store root, collection or segment reference does not resolve.
    #[error("not found: {0}")]
    NotFound(String),
    /// Staging filesystem does not have room for a copy of the segment.
    #[error(
        "insufficient space in {path}: {required} bytes required, {available} bytes available"
    )]
    InsufficientSpace {
        /// Directory the staging copy would be written to.
        path: PathBuf,
        /// Bytes required by the preflight check.
        required: u64,
        /// Bytes reported available.
        available: u64,
    },
    /// The index files of a segment could not be opened.
    #[error("failed to open index at {path}: {reason}")]
    IndexOpenFailure {
        /// Segment directory.
        path: PathBuf,
        /// Reason reported by the driver.
        reason: String,
    },
    /// The index files were opened but their contents are inconsistent.
    #[error("index at {path} is corrupt: {detail}")]
    IndexCorrupt {
        /// Segment directory.
        path: PathBuf,
        /// Description of the inconsistency.
        detail: String,
    },
    /// The side-car metadata file exists but cannot be decoded.
    #[error("side-car metadata {path} is corrupt: {detail}")]
    SidecarCorrupt {
        /// Side-car file path.
        path: PathBuf,
        /// Description of the decoding failure.
        detail: String,
    },
    /// A configuration value is out of range or of the wrong type.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Catalog statement or transaction failure. Any open transaction has been
    /// rolled back by the time this is observed.
    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),
    /// JSON encoding or decoding failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Custom error message.
    #[error("{0}")]
    Message(String),
}

/// Result type alias for maintenance operations.
pub type Result<T> = std::result::Result<T, MaintError>;

impl MaintError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        MaintError::NotFound(what.into())
    }

    pub(crate) fn index_open(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        MaintError::IndexOpenFailure {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    pub(crate) fn index_corrupt(path: impl AsRef<Path>, detail: impl Into<String>) -> Self {
        MaintError::IndexCorrupt {
            path: path.as_ref().to_path_buf(),
            detail: detail.into(),
        }
    }

    pub(crate) fn sidecar_corrupt(path: impl AsRef<Path>, detail: impl Into<String>) -> Self {
        MaintError::SidecarCorrupt {
            path: path.as_ref().to_path_buf(),
            detail: detail.into(),
        }
    }

    /// Whether the failure happened before anything was mutated and the same
    /// call may be retried once the condition is cleared.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MaintError::InsufficientSpace { .. } | MaintError::Io(_))
    }
}
