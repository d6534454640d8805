//! Transfer task types and the persistent task store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, StoreError, check_affected, from_db_u64, to_db_i64};
use crate::Database;
use crate::clock::now_millis;
use crate::content::Tier;
use crate::transfer::{FailureType, ResumeToken};

/// What a unit of content is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Audio payload for one chapter.
    ChapterAudio,
    /// Text/HTML payload for one chapter.
    ChapterText,
    /// Cover artwork for the whole resource.
    CoverImage,
}

impl TaskKind {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChapterAudio => "chapter_audio",
            Self::ChapterText => "chapter_text",
            Self::CoverImage => "cover_image",
        }
    }

    /// Chapter kinds count towards a resource's completion.
    #[must_use]
    pub fn is_chapter(&self) -> bool {
        matches!(self, Self::ChapterAudio | Self::ChapterText)
    }

    /// File extension used for stored payloads of this kind.
    #[must_use]
    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::ChapterAudio => "audio",
            Self::ChapterText => "html",
            Self::CoverImage => "img",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chapter_audio" => Ok(Self::ChapterAudio),
            "chapter_text" => Ok(Self::ChapterText),
            "cover_image" => Ok(Self::CoverImage),
            _ => Err(format!("invalid task kind: {s}")),
        }
    }
}

/// Scheduling priority. Declaration order is the ordering: `Low < Normal < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Integer stored in the database; higher sorts first.
    #[must_use]
    pub fn as_db(&self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    /// Parses the stored integer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidValue`] for unknown values.
    pub fn from_db(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Low),
            1 => Ok(Self::Normal),
            2 => Ok(Self::High),
            other => Err(StoreError::invalid_value("priority", other.to_string())),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        f.write_str(label)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            _ => Err(format!("invalid priority: {s}")),
        }
    }
}

/// Lifecycle state of a transfer task.
///
/// Removal is not a status: removed tasks are deleted from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for admission.
    Queued,
    /// Admitted; an executor transfer is running.
    Downloading,
    /// Stopped by the user or by network policy.
    Paused,
    /// Payload stored in its destination tier.
    Completed,
    /// Retries exhausted or a terminal error.
    Failed,
}

impl TaskStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed tasks accept no further transitions from the scheduler.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

/// Why a task is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// Explicit pause request.
    User,
    /// Network policy forbids transfers right now.
    Network,
}

impl PauseReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Network => "network",
        }
    }
}

impl FromStr for PauseReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "network" => Ok(Self::Network),
            _ => Err(format!("invalid pause reason: {s}")),
        }
    }
}

/// Stable identity of a downloadable unit.
///
/// Two requests for the same `(resource, sub-resource, kind)` always map to the
/// same id, which is what makes re-requesting idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub resource_id: String,
    pub sub_resource_id: Option<String>,
    pub kind: TaskKind,
}

impl TaskId {
    #[must_use]
    pub fn new(
        resource_id: impl Into<String>,
        sub_resource_id: Option<String>,
        kind: TaskKind,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            sub_resource_id,
            kind,
        }
    }

    /// Audio for one chapter.
    #[must_use]
    pub fn chapter_audio(resource_id: impl Into<String>, unit_id: impl Into<String>) -> Self {
        Self::new(resource_id, Some(unit_id.into()), TaskKind::ChapterAudio)
    }

    /// Text payload for one chapter.
    #[must_use]
    pub fn chapter_text(resource_id: impl Into<String>, unit_id: impl Into<String>) -> Self {
        Self::new(resource_id, Some(unit_id.into()), TaskKind::ChapterText)
    }

    /// Resource-level cover image.
    #[must_use]
    pub fn cover(resource_id: impl Into<String>) -> Self {
        Self::new(resource_id, None, TaskKind::CoverImage)
    }

    /// Hex SHA-256 over a length-prefixed encoding of the identity tuple.
    ///
    /// Safe for use as a file name and as a unique database key. Never parsed back.
    #[must_use]
    pub fn storage_key(&self) -> String {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, Some(&self.resource_id));
        hash_field(&mut hasher, self.sub_resource_id.as_deref());
        hash_field(&mut hasher, Some(self.kind.as_str()));
        hex_digest(&hasher.finalize())
    }

    /// Short, filesystem-safe directory name for everything belonging to a resource.
    #[must_use]
    pub fn resource_dir_name(resource_id: &str) -> String {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, Some(resource_id));
        let digest = hex_digest(&hasher.finalize());
        digest[..24].to_string()
    }
}

fn hash_field(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        Some(value) => {
            hasher.update([1u8]);
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        None => hasher.update([0u8]),
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.resource_id,
            self.sub_resource_id.as_deref().unwrap_or("-"),
            self.kind
        )
    }
}

/// A single downloadable unit and its transfer state.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferTask {
    pub id: TaskId,
    /// Insertion sequence; tie-breaker for FIFO admission.
    pub seq: i64,
    /// Remote URL, or `None` until resolved through the content API.
    pub source_location: Option<String>,
    /// Tier the finished payload is stored in. The key is the task id.
    pub destination_tier: Tier,
    pub priority: Priority,
    pub status: TaskStatus,
    pub pause_reason: Option<PauseReason>,
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub resume_token: Option<ResumeToken>,
    /// Source must be re-resolved before the next attempt.
    pub needs_resolve: bool,
    /// Earliest admission time (unix ms) while backing off.
    pub not_before: Option<i64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
    pub last_error: Option<String>,
    pub failure: Option<FailureType>,
}

impl fmt::Display for TransferTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TransferTask {{ id: {}, status: {}, bytes: {}/{} }}",
            self.id,
            self.status,
            self.bytes_transferred,
            self.bytes_total
                .map_or_else(|| "?".to_string(), |t| t.to_string())
        )
    }
}

/// Raw row as stored; converted into [`TransferTask`] with typed fields.
#[derive(Debug, FromRow)]
struct TaskRow {
    seq: i64,
    resource_id: String,
    sub_resource_id: Option<String>,
    kind: String,
    source_location: Option<String>,
    destination_tier: String,
    priority: i64,
    status: String,
    pause_reason: Option<String>,
    bytes_transferred: i64,
    bytes_total: Option<i64>,
    retry_count: i64,
    max_retries: i64,
    resume_token: Option<Vec<u8>>,
    needs_resolve: bool,
    not_before: Option<i64>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    updated_at: i64,
    last_error: Option<String>,
    failure_kind: Option<String>,
}

impl TryFrom<TaskRow> for TransferTask {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let kind = row
            .kind
            .parse::<TaskKind>()
            .map_err(|_| StoreError::invalid_value("kind", row.kind.clone()))?;
        let destination_tier = row
            .destination_tier
            .parse::<Tier>()
            .map_err(|_| StoreError::invalid_value("destination_tier", row.destination_tier.clone()))?;
        let status = row
            .status
            .parse::<TaskStatus>()
            .map_err(|_| StoreError::invalid_value("status", row.status.clone()))?;
        let pause_reason = row
            .pause_reason
            .as_deref()
            .map(|raw| {
                raw.parse::<PauseReason>()
                    .map_err(|_| StoreError::invalid_value("pause_reason", raw))
            })
            .transpose()?;
        let failure = row
            .failure_kind
            .as_deref()
            .map(|raw| {
                raw.parse::<FailureType>()
                    .map_err(|_| StoreError::invalid_value("failure_kind", raw))
            })
            .transpose()?;

        Ok(Self {
            id: TaskId::new(row.resource_id, row.sub_resource_id, kind),
            seq: row.seq,
            source_location: row.source_location,
            destination_tier,
            priority: Priority::from_db(row.priority)?,
            status,
            pause_reason,
            bytes_transferred: from_db_u64(row.bytes_transferred),
            bytes_total: row.bytes_total.map(from_db_u64),
            retry_count: u32::try_from(row.retry_count.max(0)).unwrap_or(u32::MAX),
            max_retries: u32::try_from(row.max_retries.max(0)).unwrap_or(u32::MAX),
            resume_token: row.resume_token.map(ResumeToken::from_bytes),
            needs_resolve: row.needs_resolve,
            not_before: row.not_before,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
            last_error: row.last_error,
            failure,
        })
    }
}

fn rows_into_tasks(rows: Vec<TaskRow>) -> Result<Vec<TransferTask>> {
    rows.into_iter().map(TransferTask::try_from).collect()
}

/// Input for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: TaskId,
    pub source_location: Option<String>,
    pub destination_tier: Tier,
    pub priority: Priority,
    pub bytes_total: Option<u64>,
    pub max_retries: u32,
}

/// How a failed attempt is written back.
#[derive(Debug, Clone)]
pub struct RetryUpdate {
    /// New retry count after this failure.
    pub retry_count: u32,
    /// Earliest time the task may be admitted again.
    pub not_before: i64,
    pub last_error: String,
    pub failure: FailureType,
    /// Re-resolve the source location before the next attempt.
    pub needs_resolve: bool,
    /// Resume state to continue from, or `None` to restart from zero.
    pub resume_token: Option<ResumeToken>,
    pub bytes_transferred: u64,
}

/// `SQLite`-backed map of `TaskId -> TransferTask`.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db: Database,
}

const ADMISSION_ORDER: &str = "ORDER BY priority DESC, created_at ASC, seq ASC";

impl TaskStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a new queued task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] with a constraint violation if a task
    /// with the same id already exists.
    #[instrument(skip(self, task), fields(task = %task.id, tier = %task.destination_tier))]
    pub async fn insert(&self, task: &NewTask) -> Result<TransferTask> {
        let now = now_millis();
        let row = sqlx::query_as::<_, TaskRow>(
            r"INSERT INTO transfer_tasks (
                task_key, resource_id, sub_resource_id, kind, source_location,
                destination_tier, priority, status, bytes_transferred, bytes_total,
                max_retries, created_at, updated_at
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING *",
        )
        .bind(task.id.storage_key())
        .bind(&task.id.resource_id)
        .bind(task.id.sub_resource_id.as_deref())
        .bind(task.id.kind.as_str())
        .bind(task.source_location.as_deref())
        .bind(task.destination_tier.as_str())
        .bind(task.priority.as_db())
        .bind(TaskStatus::Queued.as_str())
        .bind(0_i64)
        .bind(task.bytes_total.map(to_db_i64))
        .bind(i64::from(task.max_retries))
        .bind(now)
        .bind(now)
        .fetch_one(self.db.pool())
        .await?;

        TransferTask::try_from(row)
    }

    /// Gets a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self), fields(task = %id))]
    pub async fn get(&self, id: &TaskId) -> Result<Option<TransferTask>> {
        let row = sqlx::query_as::<_, TaskRow>("SELECT * FROM transfer_tasks WHERE task_key = ?")
            .bind(id.storage_key())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(TransferTask::try_from).transpose()
    }

    /// Lists every task of a resource in admission order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_for_resource(&self, resource_id: &str) -> Result<Vec<TransferTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT * FROM transfer_tasks WHERE resource_id = ? {ADMISSION_ORDER}"
        ))
        .bind(resource_id)
        .fetch_all(self.db.pool())
        .await?;
        rows_into_tasks(rows)
    }

    /// Lists tasks in a status, in admission order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TransferTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT * FROM transfer_tasks WHERE status = ? {ADMISSION_ORDER}"
        ))
        .bind(status.as_str())
        .fetch_all(self.db.pool())
        .await?;
        rows_into_tasks(rows)
    }

    /// Queued tasks whose backoff has elapsed at `now`, in admission order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_admissible(&self, now: i64, limit: usize) -> Result<Vec<TransferTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT * FROM transfer_tasks
             WHERE status = 'queued' AND (not_before IS NULL OR not_before <= ?)
             {ADMISSION_ORDER}
             LIMIT ?"
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(self.db.pool())
        .await?;
        rows_into_tasks(rows)
    }

    /// Earliest pending backoff deadline among queued tasks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn next_backoff_deadline(&self) -> Result<Option<i64>> {
        let (deadline,): (Option<i64>,) = sqlx::query_as(
            "SELECT MIN(not_before) FROM transfer_tasks WHERE status = 'queued' AND not_before IS NOT NULL",
        )
        .fetch_one(self.db.pool())
        .await?;
        Ok(deadline)
    }

    /// Lists every task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_all(&self) -> Result<Vec<TransferTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT * FROM transfer_tasks {ADMISSION_ORDER}"
        ))
        .fetch_all(self.db.pool())
        .await?;
        rows_into_tasks(rows)
    }

    /// `queued -> downloading`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    #[instrument(skip(self), fields(task = %id))]
    pub async fn mark_downloading(&self, id: &TaskId) -> Result<()> {
        let now = now_millis();
        let result = sqlx::query(
            r"UPDATE transfer_tasks
              SET status = 'downloading', pause_reason = NULL, not_before = NULL,
                  started_at = ?, updated_at = ?
              WHERE task_key = ?",
        )
        .bind(now)
        .bind(now)
        .bind(id.storage_key())
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Records transfer progress.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    pub async fn update_progress(
        &self,
        id: &TaskId,
        bytes_transferred: u64,
        bytes_total: Option<u64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE transfer_tasks
              SET bytes_transferred = ?, bytes_total = COALESCE(?, bytes_total), updated_at = ?
              WHERE task_key = ?",
        )
        .bind(to_db_i64(bytes_transferred))
        .bind(bytes_total.map(to_db_i64))
        .bind(now_millis())
        .bind(id.storage_key())
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Stores a freshly resolved source location.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    #[instrument(skip(self, source), fields(task = %id))]
    pub async fn set_source(
        &self,
        id: &TaskId,
        source: &str,
        expected_bytes: Option<u64>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE transfer_tasks
              SET source_location = ?, bytes_total = COALESCE(?, bytes_total),
                  needs_resolve = 0, updated_at = ?
              WHERE task_key = ?",
        )
        .bind(source)
        .bind(expected_bytes.map(to_db_i64))
        .bind(now_millis())
        .bind(id.storage_key())
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// `downloading -> completed`. Clears resume and failure state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    #[instrument(skip(self), fields(task = %id))]
    pub async fn mark_completed(&self, id: &TaskId, bytes: u64) -> Result<()> {
        let now = now_millis();
        let result = sqlx::query(
            r"UPDATE transfer_tasks
              SET status = 'completed', bytes_transferred = ?,
                  bytes_total = COALESCE(bytes_total, ?),
                  resume_token = NULL, pause_reason = NULL, not_before = NULL,
                  last_error = NULL, failure_kind = NULL,
                  completed_at = ?, updated_at = ?
              WHERE task_key = ?",
        )
        .bind(to_db_i64(bytes))
        .bind(to_db_i64(bytes))
        .bind(now)
        .bind(now)
        .bind(id.storage_key())
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Moves a task to `paused`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    #[instrument(skip(self), fields(task = %id, reason = reason.as_str()))]
    pub async fn mark_paused(&self, id: &TaskId, reason: PauseReason) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE transfer_tasks
              SET status = 'paused', pause_reason = ?, not_before = NULL, updated_at = ?
              WHERE task_key = ?",
        )
        .bind(reason.as_str())
        .bind(now_millis())
        .bind(id.storage_key())
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Stores (or clears) the resume token captured when a transfer stopped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    #[instrument(skip(self, token), fields(task = %id, has_token = token.is_some()))]
    pub async fn store_resume_token(
        &self,
        id: &TaskId,
        token: Option<&ResumeToken>,
        bytes_transferred: u64,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE transfer_tasks
              SET resume_token = ?, bytes_transferred = ?, updated_at = ?
              WHERE task_key = ?",
        )
        .bind(token.map(ResumeToken::as_bytes))
        .bind(to_db_i64(bytes_transferred))
        .bind(now_millis())
        .bind(id.storage_key())
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// `downloading -> queued` after a recoverable failure, with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    #[instrument(skip(self, update), fields(task = %id, retry_count = update.retry_count))]
    pub async fn requeue_for_retry(&self, id: &TaskId, update: &RetryUpdate) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE transfer_tasks
              SET status = 'queued', pause_reason = NULL, retry_count = ?, not_before = ?,
                  last_error = ?, failure_kind = ?, needs_resolve = ?,
                  resume_token = ?, bytes_transferred = ?, updated_at = ?
              WHERE task_key = ?",
        )
        .bind(i64::from(update.retry_count))
        .bind(update.not_before)
        .bind(&update.last_error)
        .bind(update.failure.as_str())
        .bind(update.needs_resolve)
        .bind(update.resume_token.as_ref().map(ResumeToken::as_bytes))
        .bind(to_db_i64(update.bytes_transferred))
        .bind(now_millis())
        .bind(id.storage_key())
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Moves a task to `queued` without touching its retry budget.
    ///
    /// Used on resume and when a stale `downloading` row is recovered.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    #[instrument(skip(self), fields(task = %id))]
    pub async fn requeue(&self, id: &TaskId) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE transfer_tasks
              SET status = 'queued', pause_reason = NULL, not_before = NULL, updated_at = ?
              WHERE task_key = ?",
        )
        .bind(now_millis())
        .bind(id.storage_key())
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// `* -> failed`. Terminal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    #[instrument(skip(self, error), fields(task = %id, retry_count, failure = failure.as_str()))]
    pub async fn mark_failed(
        &self,
        id: &TaskId,
        retry_count: u32,
        error: &str,
        failure: FailureType,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE transfer_tasks
              SET status = 'failed', retry_count = ?, last_error = ?, failure_kind = ?,
                  resume_token = NULL, not_before = NULL, pause_reason = NULL, updated_at = ?
              WHERE task_key = ?",
        )
        .bind(i64::from(retry_count))
        .bind(error)
        .bind(failure.as_str())
        .bind(now_millis())
        .bind(id.storage_key())
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Restarts a task from scratch with a fresh retry budget.
    ///
    /// Used for the retry affordance on failed units and for completed units
    /// whose payload has disappeared from disk.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    #[instrument(skip(self), fields(task = %id))]
    pub async fn reset(&self, id: &TaskId, tier: Tier, priority: Priority) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE transfer_tasks
              SET status = 'queued', destination_tier = ?, priority = ?,
                  retry_count = 0, bytes_transferred = 0, resume_token = NULL,
                  pause_reason = NULL, not_before = NULL, last_error = NULL,
                  failure_kind = NULL, completed_at = NULL, started_at = NULL,
                  updated_at = ?
              WHERE task_key = ?",
        )
        .bind(tier.as_str())
        .bind(priority.as_db())
        .bind(now_millis())
        .bind(id.storage_key())
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Changes where a task's payload goes and how urgently.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    #[instrument(skip(self), fields(task = %id))]
    pub async fn update_destination(
        &self,
        id: &TaskId,
        tier: Tier,
        priority: Priority,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE transfer_tasks
              SET destination_tier = ?, priority = ?, updated_at = ?
              WHERE task_key = ?",
        )
        .bind(tier.as_str())
        .bind(priority.as_db())
        .bind(now_millis())
        .bind(id.storage_key())
        .execute(self.db.pool())
        .await?;
        check_affected(id, result.rows_affected())
    }

    /// Deletes a task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TaskNotFound`] if the task does not exist.
    #[instrument(skip(self), fields(task = %id))]
    pub async fn remove(&self, id: &TaskId) -> Result<()> {
        let result = sqlx::query("DELETE FROM transfer_tasks WHERE task_key = ?")
            .bind(id.storage_key())
            .execute(self.db.pool())
            .await?;
        check_affected(id, result.rows_affected())
    }

    /// Deletes every task of a resource, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn remove_for_resource(&self, resource_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM transfer_tasks WHERE resource_id = ?")
            .bind(resource_id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_task(id: TaskId, priority: Priority) -> NewTask {
        NewTask {
            id,
            source_location: Some("https://cdn.example.com/a.mp3".to_string()),
            destination_tier: Tier::Persistent,
            priority,
            bytes_total: None,
            max_retries: 3,
        }
    }

    async fn store() -> TaskStore {
        TaskStore::new(Database::new_in_memory().await.unwrap())
    }

    #[test]
    fn test_storage_key_is_deterministic() {
        let a = TaskId::chapter_audio("book-1", "ch-1");
        let b = TaskId::chapter_audio("book-1", "ch-1");
        assert_eq!(a.storage_key(), b.storage_key());
        assert_eq!(a.storage_key().len(), 64);
    }

    #[test]
    fn test_storage_key_separates_underscore_ambiguity() {
        // "a_b" + "c" must not collide with "a" + "b_c".
        let left = TaskId::chapter_audio("a_b", "c");
        let right = TaskId::chapter_audio("a", "b_c");
        assert_ne!(left.storage_key(), right.storage_key());
    }

    #[test]
    fn test_storage_key_distinguishes_kind_and_missing_unit() {
        let audio = TaskId::chapter_audio("book", "1");
        let text = TaskId::chapter_text("book", "1");
        let cover = TaskId::cover("book");
        let empty_unit = TaskId::new("book", Some(String::new()), TaskKind::CoverImage);
        assert_ne!(audio.storage_key(), text.storage_key());
        assert_ne!(cover.storage_key(), empty_unit.storage_key());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!("removed".parse::<TaskStatus>().is_err());
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let store = store().await;
        let id = TaskId::chapter_audio("book-1", "ch-1");
        let created = store.insert(&new_task(id.clone(), Priority::High)).await.unwrap();

        assert_eq!(created.status, TaskStatus::Queued);
        assert_eq!(created.priority, Priority::High);
        assert_eq!(created.retry_count, 0);
        assert!(created.resume_token.is_none());

        let fetched = store.get(&id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = store().await;
        let id = TaskId::cover("book-1");
        store.insert(&new_task(id.clone(), Priority::Normal)).await.unwrap();
        let err = store
            .insert(&new_task(id, Priority::Normal))
            .await
            .unwrap_err();
        assert_eq!(
            err.database_kind(),
            Some(super::super::StoreDbErrorKind::ConstraintViolation)
        );
    }

    #[tokio::test]
    async fn test_list_admissible_orders_priority_then_fifo() {
        let store = store().await;
        let low = TaskId::chapter_audio("b", "low");
        let first = TaskId::chapter_audio("b", "first");
        let second = TaskId::chapter_audio("b", "second");
        let high = TaskId::chapter_audio("b", "high");
        store.insert(&new_task(low.clone(), Priority::Low)).await.unwrap();
        store.insert(&new_task(first.clone(), Priority::Normal)).await.unwrap();
        store.insert(&new_task(second.clone(), Priority::Normal)).await.unwrap();
        store.insert(&new_task(high.clone(), Priority::High)).await.unwrap();

        let order: Vec<TaskId> = store
            .list_admissible(now_millis(), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec![high, first, second, low]);
    }

    #[tokio::test]
    async fn test_backoff_hides_task_until_deadline() {
        let store = store().await;
        let id = TaskId::chapter_audio("b", "1");
        store.insert(&new_task(id.clone(), Priority::Normal)).await.unwrap();
        store.mark_downloading(&id).await.unwrap();

        let deadline = now_millis() + 60_000;
        store
            .requeue_for_retry(
                &id,
                &RetryUpdate {
                    retry_count: 1,
                    not_before: deadline,
                    last_error: "HTTP 503".to_string(),
                    failure: FailureType::Transient,
                    needs_resolve: false,
                    resume_token: None,
                    bytes_transferred: 0,
                },
            )
            .await
            .unwrap();

        assert!(store.list_admissible(now_millis(), 10).await.unwrap().is_empty());
        assert_eq!(store.list_admissible(deadline, 10).await.unwrap().len(), 1);
        assert_eq!(store.next_backoff_deadline().await.unwrap(), Some(deadline));

        let task = store.get(&id).await.unwrap().unwrap();
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.failure, Some(FailureType::Transient));
    }

    #[tokio::test]
    async fn test_resume_token_persists_as_blob() {
        let store = store().await;
        let id = TaskId::chapter_audio("b", "1");
        store.insert(&new_task(id.clone(), Priority::Normal)).await.unwrap();
        store.mark_paused(&id, PauseReason::Network).await.unwrap();
        let token = ResumeToken::from_bytes(vec![1, 2, 3, 0, 255]);
        store.store_resume_token(&id, Some(&token), 42).await.unwrap();

        let task = store.get(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(task.pause_reason, Some(PauseReason::Network));
        assert_eq!(task.resume_token, Some(token));
        assert_eq!(task.bytes_transferred, 42);
    }

    #[tokio::test]
    async fn test_missing_task_reports_not_found() {
        let store = store().await;
        let result = store.mark_downloading(&TaskId::cover("nope")).await;
        assert!(matches!(result, Err(StoreError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_for_resource_only_touches_that_resource() {
        let store = store().await;
        store
            .insert(&new_task(TaskId::chapter_audio("a", "1"), Priority::Normal))
            .await
            .unwrap();
        store
            .insert(&new_task(TaskId::chapter_audio("a", "2"), Priority::Normal))
            .await
            .unwrap();
        store
            .insert(&new_task(TaskId::chapter_audio("b", "1"), Priority::Normal))
            .await
            .unwrap();

        assert_eq!(store.remove_for_resource("a").await.unwrap(), 2);
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }
}
