//! # Design
//!
//! - Constant error messages; the operation and path travel as fields.
//! - Conversion into `TransferError` decides retryability from the IO error kind.

use std::io;
use std::path::PathBuf;

use ferry_core::TransferError;
use thiserror::Error;

/// Result type for filesystem operations.
pub type FsOpsResult<T> = Result<T, FsOpsError>;

/// Errors produced by local file transfers and the cache store.
#[derive(Debug, Error)]
pub enum FsOpsError {
    /// IO failures while interacting with the filesystem.
    #[error("fsops io failure")]
    Io {
        /// Operation that triggered the IO failure.
        operation: &'static str,
        /// Path involved in the IO failure.
        path: PathBuf,
        /// Underlying IO error.
        source: io::Error,
    },
    /// Ownership changes failed.
    #[error("fsops nix failure")]
    Nix {
        /// Operation that triggered the nix failure.
        operation: &'static str,
        /// Path involved in the nix failure.
        path: PathBuf,
        /// Underlying nix error.
        source: nix::Error,
    },
    /// Input validation failures.
    #[error("fsops invalid input")]
    InvalidInput {
        /// Field that failed validation.
        field: &'static str,
        /// Static reason for the failure.
        reason: &'static str,
        /// Offending value when available.
        value: Option<String>,
    },
    /// The copy was cancelled at a buffer boundary.
    #[error("fsops copy cancelled")]
    Cancelled {
        /// File that was being written.
        path: PathBuf,
    },
}

impl FsOpsError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same operation could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => !matches!(
                source.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::StorageFull
                    | io::ErrorKind::ReadOnlyFilesystem
                    | io::ErrorKind::IsADirectory
                    | io::ErrorKind::InvalidInput
            ),
            Self::Nix { source, .. } => {
                !matches!(source, nix::Error::EPERM | nix::Error::EACCES | nix::Error::ENOENT)
            }
            Self::InvalidInput { .. } | Self::Cancelled { .. } => false,
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::Io {
                operation,
                path,
                source,
            } => format!("{operation} '{}': {source}", path.display()),
            Self::Nix {
                operation,
                path,
                source,
            } => format!("{operation} '{}': {source}", path.display()),
            Self::InvalidInput {
                field,
                reason,
                value,
            } => match value {
                Some(value) => format!("invalid {field} '{value}': {reason}"),
                None => format!("invalid {field}: {reason}"),
            },
            Self::Cancelled { path } => format!("copy to '{}' cancelled", path.display()),
        }
    }
}

impl From<FsOpsError> for TransferError {
    fn from(err: FsOpsError) -> Self {
        let detail = err.detail();
        match err {
            FsOpsError::Cancelled { .. } => Self::cancelled(detail),
            other if other.is_retryable() => Self::temporary(detail),
            _ => Self::permanent(detail),
        }
    }
}
