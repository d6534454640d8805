//! Persistent stores for transfer tasks, content records and the content index.
//!
//! All three maps share one [`Database`](crate::Database) and survive process
//! death. Every scheduler transition is written here before it is considered
//! complete.
//!
//! # Overview
//!
//! - [`TaskStore`] - `TaskId -> TransferTask`, including the opaque resume token
//! - [`RecordStore`] - `resource_id -> ContentRecord`
//! - [`IndexStore`] - `(tier, key) -> IndexEntry` backing the content store index
//!
//! # Example
//!
//! ```ignore
//! use offline_content::store::{NewTask, Priority, TaskId, TaskStore};
//! use offline_content::{Database, content::Tier};
//!
//! let db = Database::new_in_memory().await?;
//! let tasks = TaskStore::new(db);
//! tasks.insert(&NewTask {
//!     id: TaskId::chapter_audio("book-1", "ch-1"),
//!     source_location: Some("https://cdn.example.com/1.mp3".into()),
//!     destination_tier: Tier::Persistent,
//!     priority: Priority::Normal,
//!     bytes_total: None,
//!     max_retries: 3,
//! }).await?;
//! ```

mod error;
mod index;
mod record;
mod task;

pub use error::{StoreDbErrorKind, StoreError};
pub use index::{IndexEntry, IndexStore};
pub use record::{ContentRecord, RecordAggregate, RecordStatus, RecordStore};
pub use task::{
    NewTask, PauseReason, Priority, RetryUpdate, TaskId, TaskKind, TaskStatus, TaskStore,
    TransferTask,
};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`StoreError::TaskNotFound`].
fn check_affected(id: &TaskId, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::TaskNotFound(id.to_string()))
    } else {
        Ok(())
    }
}

/// `SQLite` integers are signed; byte counts saturate instead of wrapping.
fn to_db_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
