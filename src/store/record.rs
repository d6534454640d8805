//! Content records: one aggregate row per requested parent resource.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, StoreError, from_db_u64, to_db_i64};
use super::task::{Priority, TaskStatus, TransferTask};
use crate::Database;
use crate::clock::now_millis;

/// Aggregate status of a resource, derived from its chapter tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Queued,
    Downloading,
    Completed,
    Paused,
    Failed,
}

impl RecordStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "completed" => Ok(Self::Completed),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid record status: {s}")),
        }
    }
}

/// A downloaded (or downloading) book or audiobook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentRecord {
    pub resource_id: String,
    /// Number of chapter-kind tasks known for the resource.
    pub total_units: u32,
    pub completed_units: u32,
    /// Sum of chapter byte totals, when every total is known.
    pub total_bytes_estimate: Option<u64>,
    pub downloaded_bytes: u64,
    pub status: RecordStatus,
    pub priority: Priority,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: Option<i64>,
    pub last_accessed_at: Option<i64>,
}

#[derive(Debug, FromRow)]
struct RecordRow {
    resource_id: String,
    total_units: i64,
    completed_units: i64,
    total_bytes_estimate: Option<i64>,
    downloaded_bytes: i64,
    status: String,
    priority: i64,
    created_at: i64,
    updated_at: i64,
    expires_at: Option<i64>,
    last_accessed_at: Option<i64>,
}

impl TryFrom<RecordRow> for ContentRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let status = row
            .status
            .parse::<RecordStatus>()
            .map_err(|_| StoreError::invalid_value("status", row.status.clone()))?;
        Ok(Self {
            resource_id: row.resource_id,
            total_units: u32::try_from(row.total_units.max(0)).unwrap_or(u32::MAX),
            completed_units: u32::try_from(row.completed_units.max(0)).unwrap_or(u32::MAX),
            total_bytes_estimate: row.total_bytes_estimate.map(from_db_u64),
            downloaded_bytes: from_db_u64(row.downloaded_bytes),
            status,
            priority: Priority::from_db(row.priority)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
            last_accessed_at: row.last_accessed_at,
        })
    }
}

/// Record fields recomputed from the resource's tasks after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordAggregate {
    pub total_units: u32,
    pub completed_units: u32,
    pub total_bytes_estimate: Option<u64>,
    pub downloaded_bytes: u64,
    pub status: RecordStatus,
}

impl RecordAggregate {
    /// Folds a resource's tasks into record fields.
    ///
    /// Only chapter kinds count. Status precedence is
    /// failed > downloading > queued > paused > completed, so a record is
    /// `Completed` exactly when every chapter task is completed. A resource
    /// without chapter tasks (cover only) takes its status from its other
    /// tasks instead; one with no tasks at all reports `Paused`.
    #[must_use]
    pub fn from_tasks(tasks: &[TransferTask]) -> Self {
        let chapters: Vec<&TransferTask> =
            tasks.iter().filter(|task| task.id.kind.is_chapter()).collect();

        let total_units = u32::try_from(chapters.len()).unwrap_or(u32::MAX);
        let completed_units = u32::try_from(
            chapters
                .iter()
                .filter(|task| task.status == TaskStatus::Completed)
                .count(),
        )
        .unwrap_or(u32::MAX);

        let total_bytes_estimate = if chapters.is_empty() {
            None
        } else {
            chapters
                .iter()
                .map(|task| task.bytes_total)
                .sum::<Option<u64>>()
        };
        let downloaded_bytes = chapters.iter().map(|task| task.bytes_transferred).sum();

        let basis: Vec<&TransferTask> = if chapters.is_empty() {
            tasks.iter().collect()
        } else {
            chapters.clone()
        };
        let has = |status: TaskStatus| basis.iter().any(|task| task.status == status);
        let status = if has(TaskStatus::Failed) {
            RecordStatus::Failed
        } else if has(TaskStatus::Downloading) {
            RecordStatus::Downloading
        } else if has(TaskStatus::Queued) {
            RecordStatus::Queued
        } else if has(TaskStatus::Paused) || basis.is_empty() {
            RecordStatus::Paused
        } else {
            RecordStatus::Completed
        };

        Self {
            total_units,
            completed_units,
            total_bytes_estimate,
            downloaded_bytes,
            status,
        }
    }

    /// Completion in `0.0..=1.0`.
    ///
    /// Byte-based when every chapter total is known, otherwise
    /// `completed_units / total_units`.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if let Some(total) = self.total_bytes_estimate
            && total > 0
        {
            return (self.downloaded_bytes as f64 / total as f64).min(1.0);
        }
        if self.total_units == 0 {
            return if self.status == RecordStatus::Completed { 1.0 } else { 0.0 };
        }
        f64::from(self.completed_units) / f64::from(self.total_units)
    }
}

/// `SQLite`-backed map of `resource_id -> ContentRecord`.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: Database,
}

impl RecordStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Creates the record for a download request, or refreshes an existing one.
    ///
    /// Priority only ever rises. A new `expires_at` replaces the old one so
    /// re-requesting extends retention.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    #[instrument(skip(self))]
    pub async fn upsert_requested(
        &self,
        resource_id: &str,
        priority: Priority,
        expires_at: Option<i64>,
    ) -> Result<ContentRecord> {
        let now = now_millis();
        let row = sqlx::query_as::<_, RecordRow>(
            r"INSERT INTO content_records (resource_id, status, priority, created_at, updated_at, expires_at)
              VALUES (?, 'queued', ?, ?, ?, ?)
              ON CONFLICT(resource_id) DO UPDATE SET
                  priority = MAX(content_records.priority, excluded.priority),
                  expires_at = COALESCE(excluded.expires_at, content_records.expires_at),
                  updated_at = excluded.updated_at
              RETURNING *",
        )
        .bind(resource_id)
        .bind(priority.as_db())
        .bind(now)
        .bind(now)
        .bind(expires_at)
        .fetch_one(self.db.pool())
        .await?;
        ContentRecord::try_from(row)
    }

    /// Gets a record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn get(&self, resource_id: &str) -> Result<Option<ContentRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT * FROM content_records WHERE resource_id = ?",
        )
        .bind(resource_id)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(ContentRecord::try_from).transpose()
    }

    /// Lists every record, most recently requested first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list(&self) -> Result<Vec<ContentRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            "SELECT * FROM content_records ORDER BY created_at DESC, resource_id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(ContentRecord::try_from).collect()
    }

    /// Writes recomputed aggregate fields.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record exists.
    #[instrument(skip(self, aggregate), fields(status = %aggregate.status))]
    pub async fn save_aggregate(
        &self,
        resource_id: &str,
        aggregate: &RecordAggregate,
    ) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE content_records
              SET total_units = ?, completed_units = ?, total_bytes_estimate = ?,
                  downloaded_bytes = ?, status = ?, updated_at = ?
              WHERE resource_id = ?",
        )
        .bind(i64::from(aggregate.total_units))
        .bind(i64::from(aggregate.completed_units))
        .bind(aggregate.total_bytes_estimate.map(to_db_i64))
        .bind(to_db_i64(aggregate.downloaded_bytes))
        .bind(aggregate.status.as_str())
        .bind(now_millis())
        .bind(resource_id)
        .execute(self.db.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RecordNotFound(resource_id.to_string()));
        }
        Ok(())
    }

    /// Refreshes `last_accessed_at`. Missing records are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the write fails.
    pub async fn touch(&self, resource_id: &str, at: i64) -> Result<()> {
        sqlx::query("UPDATE content_records SET last_accessed_at = ? WHERE resource_id = ?")
            .bind(at)
            .bind(resource_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Deletes a record. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn remove(&self, resource_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM content_records WHERE resource_id = ?")
            .bind(resource_id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Resource ids whose retention has lapsed at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn list_expired(&self, now: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT resource_id FROM content_records WHERE expires_at IS NOT NULL AND expires_at <= ? ORDER BY expires_at",
        )
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::content::Tier;
    use crate::store::task::{TaskId, TaskKind};

    fn task(unit: &str, kind: TaskKind, status: TaskStatus, total: Option<u64>) -> TransferTask {
        TransferTask {
            id: TaskId::new("book", Some(unit.to_string()), kind),
            seq: 0,
            source_location: None,
            destination_tier: Tier::Persistent,
            priority: Priority::Normal,
            status,
            pause_reason: None,
            bytes_transferred: if status == TaskStatus::Completed {
                total.unwrap_or(0)
            } else {
                0
            },
            bytes_total: total,
            retry_count: 0,
            max_retries: 3,
            resume_token: None,
            needs_resolve: false,
            not_before: None,
            created_at: 0,
            started_at: None,
            completed_at: None,
            updated_at: 0,
            last_error: None,
            failure: None,
        }
    }

    #[test]
    fn test_aggregate_completed_only_when_all_chapters_completed() {
        let tasks = vec![
            task("1", TaskKind::ChapterAudio, TaskStatus::Completed, Some(10)),
            task("2", TaskKind::ChapterAudio, TaskStatus::Completed, Some(20)),
            task("c", TaskKind::CoverImage, TaskStatus::Queued, None),
        ];
        let aggregate = RecordAggregate::from_tasks(&tasks);
        assert_eq!(aggregate.status, RecordStatus::Completed);
        assert_eq!(aggregate.total_units, 2);
        assert_eq!(aggregate.completed_units, 2);
        assert_eq!(aggregate.total_bytes_estimate, Some(30));
        assert_eq!(aggregate.downloaded_bytes, 30);
    }

    #[test]
    fn test_aggregate_failed_wins_over_progress() {
        let tasks = vec![
            task("1", TaskKind::ChapterAudio, TaskStatus::Failed, Some(10)),
            task("2", TaskKind::ChapterAudio, TaskStatus::Downloading, Some(10)),
            task("3", TaskKind::ChapterText, TaskStatus::Completed, Some(5)),
        ];
        let aggregate = RecordAggregate::from_tasks(&tasks);
        assert_eq!(aggregate.status, RecordStatus::Failed);
        assert_eq!(aggregate.completed_units, 1);
    }

    #[test]
    fn test_aggregate_unknown_total_gives_no_estimate() {
        let tasks = vec![
            task("1", TaskKind::ChapterAudio, TaskStatus::Queued, Some(10)),
            task("2", TaskKind::ChapterAudio, TaskStatus::Paused, None),
        ];
        let aggregate = RecordAggregate::from_tasks(&tasks);
        assert_eq!(aggregate.status, RecordStatus::Queued);
        assert_eq!(aggregate.total_bytes_estimate, None);
    }

    #[test]
    fn test_fraction_uses_bytes_when_totals_known() {
        let mut half = task("2", TaskKind::ChapterAudio, TaskStatus::Downloading, Some(100));
        half.bytes_transferred = 50;
        let tasks = vec![
            task("1", TaskKind::ChapterAudio, TaskStatus::Completed, Some(100)),
            half,
        ];
        let fraction = RecordAggregate::from_tasks(&tasks).fraction();
        assert!((fraction - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fraction_falls_back_to_unit_counts() {
        let tasks = vec![
            task("1", TaskKind::ChapterText, TaskStatus::Completed, Some(10)),
            task("2", TaskKind::ChapterText, TaskStatus::Queued, None),
            task("3", TaskKind::ChapterText, TaskStatus::Queued, None),
            task("4", TaskKind::ChapterText, TaskStatus::Queued, None),
        ];
        let fraction = RecordAggregate::from_tasks(&tasks).fraction();
        assert!((fraction - 0.25).abs() < f64::EPSILON);
        assert!(RecordAggregate::from_tasks(&[]).fraction().abs() < f64::EPSILON);
    }

    #[test]
    fn test_aggregate_empty_is_paused() {
        let aggregate = RecordAggregate::from_tasks(&[]);
        assert_eq!(aggregate.status, RecordStatus::Paused);
        assert_eq!(aggregate.total_units, 0);
    }

    #[test]
    fn test_aggregate_cover_only_follows_cover_task() {
        let done = RecordAggregate::from_tasks(&[task(
            "c",
            TaskKind::CoverImage,
            TaskStatus::Completed,
            None,
        )]);
        assert_eq!(done.status, RecordStatus::Completed);
        assert_eq!(done.total_units, 0);
        assert!((done.fraction() - 1.0).abs() < f64::EPSILON);

        let pending = RecordAggregate::from_tasks(&[task(
            "c",
            TaskKind::CoverImage,
            TaskStatus::Queued,
            None,
        )]);
        assert_eq!(pending.status, RecordStatus::Queued);
        assert!(pending.fraction().abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_upsert_raises_priority_and_keeps_created_at() {
        let store = RecordStore::new(Database::new_in_memory().await.unwrap());
        let first = store
            .upsert_requested("book", Priority::Low, None)
            .await
            .unwrap();
        let second = store
            .upsert_requested("book", Priority::High, Some(99))
            .await
            .unwrap();
        let third = store
            .upsert_requested("book", Priority::Normal, None)
            .await
            .unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(third.priority, Priority::High);
        assert_eq!(third.expires_at, Some(99));
    }

    #[tokio::test]
    async fn test_list_expired_and_remove() {
        let store = RecordStore::new(Database::new_in_memory().await.unwrap());
        store.upsert_requested("old", Priority::Normal, Some(100)).await.unwrap();
        store.upsert_requested("new", Priority::Normal, Some(10_000)).await.unwrap();
        store.upsert_requested("forever", Priority::Normal, None).await.unwrap();

        assert_eq!(store.list_expired(500).await.unwrap(), vec!["old".to_string()]);
        assert!(store.remove("old").await.unwrap());
        assert!(!store.remove("old").await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_save_aggregate_requires_record() {
        let store = RecordStore::new(Database::new_in_memory().await.unwrap());
        let aggregate = RecordAggregate::from_tasks(&[]);
        let err = store.save_aggregate("missing", &aggregate).await.unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound(_)));
    }
}
