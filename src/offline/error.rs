use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::content::ContentError;
use crate::scheduler::SchedulerError;
use crate::store::StoreError;
use crate::transfer::TransferError;

/// Errors returned by [`OfflineContent`](super::OfflineContent) operations.
///
/// Failed downloads are not errors: they are reported through task status,
/// the event stream and [`TaskOutcome`](crate::scheduler::TaskOutcome).
#[derive(Debug, Error)]
pub enum OfflineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The request names no resource or a malformed unit.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Querying the device for free space failed.
    #[error("failed to read free space for {path}: {source}")]
    FreeSpace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OfflineError {
    /// True when the failure comes from a full device.
    #[must_use]
    pub fn is_storage_full(&self) -> bool {
        match self {
            Self::Content(err) | Self::Scheduler(SchedulerError::Content(err)) => {
                err.is_storage_full()
            }
            _ => false,
        }
    }
}
