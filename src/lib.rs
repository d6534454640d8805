//! Offline Content Library
//!
//! Downloads the units of books and audiobooks (chapter audio, chapter text,
//! cover art) for offline use, and keeps them across restarts, network loss
//! and process death.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`offline`] - The façade other subsystems use
//! - [`scheduler`] - Admission, deduplication, retries and crash recovery
//! - [`transfer`] - HTTP transfer executor with resumable staging
//! - [`content`] - Two-tier (persistent/ephemeral) content store
//! - [`store`] - `SQLite` task, record and index stores
//! - [`network`] - Connectivity and Wi-Fi-only policy
//! - [`events`] - Progress and status stream
//! - [`api`] - Content API seam and a manifest-backed implementation
//! - [`db`] - Database connection and schema management

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod clock;
pub mod config;
pub mod content;
pub mod db;
pub mod events;
pub mod network;
pub mod offline;
pub mod scheduler;
pub mod store;
pub mod transfer;

// Re-export commonly used types
pub use config::{ConfigError, OfflineSettings};
pub use content::{ContentStore, Tier};
pub use db::Database;
pub use events::{EventFilter, TransferEvent};
pub use network::{Connectivity, NetworkMonitor};
pub use offline::{OfflineContent, OfflineError, RequestReceipt, StorageSummary, UnitRequest};
pub use scheduler::{TaskOutcome, TaskTicket};
pub use store::{Priority, TaskId, TaskKind, TaskStatus};
