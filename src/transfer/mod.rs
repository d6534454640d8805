//! Resumable HTTP transfers into the staging area.
//!
//! This module performs one network transfer per admitted task and reports
//! a terminal [`TransferOutcome`]. It knows nothing about queues or tiers:
//! the scheduler decides what runs, and the content store decides where a
//! finished payload lives.
//!
//! # Features
//!
//! - Streaming to `<staging>/<key>.part` with throttled progress callbacks
//! - Cooperative pause producing an opaque [`ResumeToken`]
//! - Resume through `Range` + `If-Range`; a changed source restarts from zero
//! - Length verification before completion is signalled
//! - A per-transfer [`SessionJournal`] so a relaunched process can find
//!   finished or half-finished transfers
//! - Failure classification feeding the retry policy
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use offline_content::store::TaskId;
//! use offline_content::transfer::{HttpTransport, TransferExecutor, TransferOutcome, TransferRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = TransferExecutor::new(HttpTransport::new()?, "/tmp/staging", Duration::from_millis(200));
//! let handle = executor.start(
//!     TransferRequest {
//!         id: TaskId::chapter_audio("book_1", "ch_1"),
//!         url: "https://cdn.example.com/ch1.mp3".to_string(),
//!         resume: None,
//!     },
//!     Arc::new(|p| println!("{} bytes", p.bytes_transferred)),
//! );
//! if let TransferOutcome::Completed { staged_path, .. } = handle.wait().await {
//!     println!("staged at {}", staged_path.display());
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod executor;
mod progress;
mod resume;
mod retry;
mod session;

pub use client::{HttpTransport, RangeRequest, USER_AGENT};
pub use error::TransferError;
pub use executor::{
    ProgressSink, RecoveredSession, RecoveredState, StopHandle, StopListener, StopReason,
    TransferExecutor, TransferHandle, TransferOutcome, TransferRequest,
};
pub use progress::{ProgressThrottle, TransferProgress};
pub use resume::ResumeToken;
pub use retry::{
    FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after, server_retry_delay,
};
pub use session::{SessionJournal, SessionState, StagingPaths};
