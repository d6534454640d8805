use thiserror::Error;

use crate::content::ContentError;
use crate::store::StoreError;
use crate::transfer::TransferError;

/// Errors returned by scheduler operations.
///
/// Failures of individual transfers are not errors here: they end up in the
/// task record and in the [`TaskOutcome`](super::TaskOutcome) sent to waiters.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The coordinating loop has exited.
    #[error("scheduler is shut down")]
    ShutDown,
}
