//! Primary error type for Ember coordination operations.
//!
//! Structured variants for the cases callers are expected to match on,
//! convenience constructors for the common ones.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors surfaced by the coordinator and the storage seam under it.
#[derive(Error, Debug)]
pub enum EmberError {
    /// A background session could not be opened for the file.
    #[error("unable to open '{path}': {detail}")]
    Access { path: PathBuf, detail: String },

    /// The file is already open with an incompatible configuration.
    #[error("{reason}")]
    MismatchedConfig { reason: String },

    /// The requested snapshot has been reclaimed by the storage engine.
    #[error("snapshot {version} is no longer available")]
    SnapshotUnavailable { version: u64 },

    /// Attempt to modify a database opened read-only.
    #[error("attempt to modify a read-only database")]
    ReadOnly,

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl EmberError {
    /// Create an [`EmberError::Access`] for `path`.
    pub fn access(path: &Path, detail: impl Into<String>) -> Self {
        Self::Access {
            path: path.to_path_buf(),
            detail: detail.into(),
        }
    }

    /// Create an [`EmberError::MismatchedConfig`].
    pub fn mismatched(reason: impl Into<String>) -> Self {
        Self::MismatchedConfig {
            reason: reason.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal(detail.into())
    }

    /// Whether this is a configuration mismatch on re-open.
    #[must_use]
    pub const fn is_mismatched_config(&self) -> bool {
        matches!(self, Self::MismatchedConfig { .. })
    }

    /// Whether the user can likely fix this without code changes.
    #[must_use]
    pub const fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Access { .. } | Self::MismatchedConfig { .. } | Self::ReadOnly
        )
    }
}

/// Result type alias using [`EmberError`].
pub type Result<T> = std::result::Result<T, EmberError>;
