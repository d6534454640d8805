//! Error types for content store operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

/// `ENOSPC` on Linux and macOS.
const ENOSPC: i32 = 28;

/// Errors from the two-tier content store.
#[derive(Debug, Error)]
pub enum ContentError {
    /// Filesystem failure at a specific path.
    #[error("IO error at {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// `promote` was asked to move a file that is not in the ephemeral tier.
    #[error("no ephemeral copy of {0}; it must be downloaded again")]
    MissingEphemeral(String),

    /// Index persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ContentError {
    /// Creates an IO error tagged with the path that failed.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the device has no space left.
    #[must_use]
    pub fn is_storage_full(&self) -> bool {
        match self {
            Self::Io { source, .. } => {
                source.kind() == io::ErrorKind::StorageFull || source.raw_os_error() == Some(ENOSPC)
            }
            _ => false,
        }
    }

    /// True when the OS denied access.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied)
    }
}
