//! Per-transfer session journal kept next to the staging file.
//!
//! The journal is what lets a relaunched process find transfers that were in
//! flight: it carries the structured task id, so it is matched back to its
//! task record without parsing file names.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::TransferError;
use crate::clock::now_millis;
use crate::store::TaskId;

const PART_EXTENSION: &str = "part";
const SESSION_EXTENSION: &str = "session";

/// Whether the staged payload is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Bytes are still arriving (or stopped part-way).
    Partial,
    /// Fully written, synced and verified; waiting to be committed.
    Complete,
}

/// On-disk journal for one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionJournal {
    pub task: TaskId,
    pub url: String,
    pub validator: Option<String>,
    pub total: Option<u64>,
    pub accepts_ranges: bool,
    pub state: SessionState,
    pub updated_at: i64,
}

/// Staging file pair for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPaths {
    pub part: PathBuf,
    pub session: PathBuf,
}

impl StagingPaths {
    #[must_use]
    pub fn new(staging_dir: &Path, id: &TaskId) -> Self {
        let key = id.storage_key();
        Self {
            part: staging_dir.join(format!("{key}.{PART_EXTENSION}")),
            session: staging_dir.join(format!("{key}.{SESSION_EXTENSION}")),
        }
    }

    /// Removes both files. Missing files are fine.
    pub async fn discard(&self) -> Result<(), TransferError> {
        for path in [&self.part, &self.session] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(TransferError::io(path, err)),
            }
        }
        Ok(())
    }
}

impl SessionJournal {
    pub(crate) fn new(
        task: &TaskId,
        url: &str,
        validator: Option<String>,
        total: Option<u64>,
        accepts_ranges: bool,
    ) -> Self {
        Self {
            task: task.clone(),
            url: url.to_string(),
            validator,
            total,
            accepts_ranges,
            state: SessionState::Partial,
            updated_at: now_millis(),
        }
    }

    /// Writes the journal atomically (temp file, sync, rename).
    pub(crate) async fn save(&self, path: &Path) -> Result<(), TransferError> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| TransferError::io(path, io::Error::other(e)))?;
        let tmp = path.with_extension("session.tmp");
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| TransferError::io(&tmp, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| TransferError::io(&tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| TransferError::io(&tmp, e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        Ok(())
    }

    /// `Ok(None)` for an unreadable journal; the caller discards it.
    pub(crate) async fn load(path: &Path) -> Result<Option<Self>, TransferError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(TransferError::io(path, err)),
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }
}

pub(crate) fn is_session_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == SESSION_EXTENSION)
}

pub(crate) fn is_part_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == PART_EXTENSION)
}
