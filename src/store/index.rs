//! Persisted content index: which logical files live in which tier.

use sqlx::FromRow;
use tracing::instrument;

use super::task::{TaskId, TaskKind};
use super::{Result, StoreError, from_db_u64, to_db_i64};
use crate::Database;
use crate::content::Tier;

/// One stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub tier: Tier,
    pub id: TaskId,
    pub size_bytes: u64,
    pub created_at: i64,
}

impl IndexEntry {
    /// Storage key of the file; equal to the owning task's key.
    #[must_use]
    pub fn key(&self) -> String {
        self.id.storage_key()
    }
}

#[derive(Debug, FromRow)]
struct IndexRow {
    tier: String,
    resource_id: String,
    sub_resource_id: Option<String>,
    kind: String,
    size_bytes: i64,
    created_at: i64,
}

impl TryFrom<IndexRow> for IndexEntry {
    type Error = StoreError;

    fn try_from(row: IndexRow) -> Result<Self> {
        let tier = row
            .tier
            .parse::<Tier>()
            .map_err(|_| StoreError::invalid_value("tier", row.tier.clone()))?;
        let kind = row
            .kind
            .parse::<TaskKind>()
            .map_err(|_| StoreError::invalid_value("kind", row.kind.clone()))?;
        Ok(Self {
            tier,
            id: TaskId::new(row.resource_id, row.sub_resource_id, kind),
            size_bytes: from_db_u64(row.size_bytes),
            created_at: row.created_at,
        })
    }
}

/// `SQLite`-backed map of `(tier, key) -> IndexEntry`.
#[derive(Debug, Clone)]
pub struct IndexStore {
    db: Database,
}

impl IndexStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Records a file in a tier and drops any entry for the same key in the other tier.
    ///
    /// Both statements run in one transaction so tier membership changes atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the transaction fails.
    #[instrument(skip(self, entry), fields(tier = %entry.tier, id = %entry.id))]
    pub async fn upsert(&self, entry: &IndexEntry) -> Result<()> {
        let key = entry.key();
        let mut tx = self.db.pool().begin().await?;

        sqlx::query("DELETE FROM content_index WHERE content_key = ? AND tier <> ?")
            .bind(&key)
            .bind(entry.tier.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r"INSERT INTO content_index (tier, content_key, resource_id, sub_resource_id, kind, size_bytes, created_at)
              VALUES (?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(tier, content_key) DO UPDATE SET
                  size_bytes = excluded.size_bytes,
                  created_at = excluded.created_at",
        )
        .bind(entry.tier.as_str())
        .bind(&key)
        .bind(&entry.id.resource_id)
        .bind(entry.id.sub_resource_id.as_deref())
        .bind(entry.id.kind.as_str())
        .bind(to_db_i64(entry.size_bytes))
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Removes one entry. Missing entries are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    pub async fn remove(&self, tier: Tier, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM content_index WHERE tier = ? AND content_key = ?")
            .bind(tier.as_str())
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Removes every entry of a resource in both tiers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    pub async fn remove_resource(&self, resource_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM content_index WHERE resource_id = ?")
            .bind(resource_id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Loads the whole index.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    pub async fn load_all(&self) -> Result<Vec<IndexEntry>> {
        let rows = sqlx::query_as::<_, IndexRow>(
            "SELECT tier, resource_id, sub_resource_id, kind, size_bytes, created_at
             FROM content_index ORDER BY created_at ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        rows.into_iter().map(IndexEntry::try_from).collect()
    }
}
