//! Offline content façade.
//!
//! [`OfflineContent`] is the single entry point other subsystems use. It owns
//! one instance of every component, built at startup and wired together
//! explicitly:
//!
//! ```text
//! OfflineContent
//!   ├── RecordStore        resource_id -> ContentRecord
//!   ├── TaskStore          TaskId -> TransferTask
//!   ├── ContentStore       persistent + ephemeral tiers
//!   ├── Scheduler ──> TransferExecutor ──> HttpTransport
//!   │        └────> ContentApi (resolution)
//!   ├── NetworkMonitor     connectivity + Wi-Fi-only policy
//!   └── EventBus           progress/status stream
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use offline_content::api::ManifestContentApi;
//! use offline_content::network::NetworkMonitor;
//! use offline_content::offline::{OfflineContent, UnitRequest};
//! use offline_content::store::Priority;
//! use offline_content::{Database, OfflineSettings};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(std::path::Path::new("/tmp/offline/offline.db")).await?;
//! let offline = OfflineContent::open(
//!     OfflineSettings::default(),
//!     db,
//!     "/tmp/offline",
//!     Arc::new(ManifestContentApi::new()),
//!     NetworkMonitor::default(),
//! )
//! .await?;
//!
//! let receipt = offline
//!     .request_download("book-1", &[UnitRequest::cover(), UnitRequest::audio("ch-1")], Priority::Normal)
//!     .await?;
//! receipt.wait_all().await;
//! assert!(offline.is_available_offline("book-1", None).await?);
//! # Ok(())
//! # }
//! ```

mod error;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

pub use error::OfflineError;

use crate::api::ContentApi;
use crate::clock::now_millis;
use crate::config::OfflineSettings;
use crate::content::{ContentStore, ReconcileReport, Tier};
use crate::db::Database;
use crate::events::{EventBus, EventFilter, EventStream, TransferEvent};
use crate::network::NetworkMonitor;
use crate::scheduler::{
    EnqueueOutcome, EnqueueRequest, RecoveryReport, Scheduler, SchedulerConfig, SchedulerDeps,
    TaskOutcome, TaskTicket,
};
use crate::store::{
    ContentRecord, IndexStore, Priority, RecordStore, TaskId, TaskKind, TaskStatus, TaskStore,
    TransferTask,
};
use crate::transfer::{HttpTransport, TransferExecutor};

/// One unit of a resource to make available offline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitRequest {
    /// Chapter id; `None` for resource-level assets.
    pub unit_id: Option<String>,
    pub kind: TaskKind,
}

impl UnitRequest {
    #[must_use]
    pub fn cover() -> Self {
        Self {
            unit_id: None,
            kind: TaskKind::CoverImage,
        }
    }

    #[must_use]
    pub fn audio(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: Some(unit_id.into()),
            kind: TaskKind::ChapterAudio,
        }
    }

    #[must_use]
    pub fn text(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: Some(unit_id.into()),
            kind: TaskKind::ChapterText,
        }
    }

    /// Task identity of this unit within `resource_id`.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::InvalidRequest`] when a chapter unit has no id
    /// or a cover carries one.
    pub fn task_id(&self, resource_id: &str) -> Result<TaskId, OfflineError> {
        match (&self.unit_id, self.kind) {
            (None, TaskKind::CoverImage) => Ok(TaskId::cover(resource_id)),
            (Some(unit), kind) if kind.is_chapter() && !unit.is_empty() => {
                Ok(TaskId::new(resource_id, Some(unit.clone()), kind))
            }
            (unit, kind) => Err(OfflineError::InvalidRequest(format!(
                "{kind} unit with id {unit:?}"
            ))),
        }
    }
}

/// Result of [`OfflineContent::request_download`].
#[derive(Debug)]
pub struct RequestReceipt {
    pub resource_id: String,
    pub record: ContentRecord,
    /// One ticket per requested unit, in request order.
    pub tickets: Vec<TaskTicket>,
}

impl RequestReceipt {
    /// Units whose request created or restarted a task.
    #[must_use]
    pub fn created(&self) -> usize {
        self.count(EnqueueOutcome::Created)
    }

    /// Units that joined a transfer already in progress.
    #[must_use]
    pub fn attached(&self) -> usize {
        self.count(EnqueueOutcome::Attached)
    }

    /// Units that were already stored.
    #[must_use]
    pub fn already_completed(&self) -> usize {
        self.count(EnqueueOutcome::AlreadyCompleted)
    }

    fn count(&self, outcome: EnqueueOutcome) -> usize {
        self.tickets
            .iter()
            .filter(|ticket| ticket.outcome() == outcome)
            .count()
    }

    /// Waits for every unit to finish and returns the outcomes in request order.
    pub async fn wait_all(self) -> Vec<(TaskId, TaskOutcome)> {
        let mut outcomes = Vec::with_capacity(self.tickets.len());
        for ticket in self.tickets {
            let id = ticket.id().clone();
            outcomes.push((id, ticket.wait().await));
        }
        outcomes
    }
}

/// Bytes held in each tier and free on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StorageSummary {
    pub persistent_bytes: u64,
    pub ephemeral_bytes: u64,
    pub available_device_bytes: u64,
}

/// The offline content subsystem.
pub struct OfflineContent {
    settings: OfflineSettings,
    tasks: TaskStore,
    records: RecordStore,
    content: Arc<ContentStore>,
    scheduler: Scheduler,
    network: NetworkMonitor,
    events: EventBus,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for OfflineContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineContent")
            .field("root", &self.content.root())
            .field("network", &self.network.state())
            .finish_non_exhaustive()
    }
}

impl OfflineContent {
    /// Builds every component under `root`, recovers interrupted transfers
    /// and starts the scheduler.
    ///
    /// `root` holds the `downloads/`, `cache/` and `staging/` directories.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Config`] for invalid settings, or the first
    /// store, content or transfer error hit while opening and recovering.
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub async fn open(
        settings: OfflineSettings,
        db: Database,
        root: impl AsRef<Path>,
        api: Arc<dyn ContentApi>,
        network: NetworkMonitor,
    ) -> Result<Self, OfflineError> {
        settings.validate()?;
        network.set_wifi_only(settings.wifi_only);

        let tasks = TaskStore::new(db.clone());
        let records = RecordStore::new(db.clone());
        let content = Arc::new(ContentStore::open(root.as_ref(), IndexStore::new(db)).await?);
        let transport = HttpTransport::with_timeouts(
            settings.connect_timeout_secs,
            settings.read_timeout_secs,
        )?;
        let executor = TransferExecutor::new(
            transport,
            content.staging_dir(),
            settings.progress_interval,
        );
        let events = EventBus::default();

        let scheduler = Scheduler::new(
            SchedulerDeps {
                tasks: tasks.clone(),
                records: records.clone(),
                content: Arc::clone(&content),
                executor,
                api,
                network: network.clone(),
                events: events.clone(),
            },
            SchedulerConfig::from_settings(&settings),
        );
        let recovery = scheduler.recover().await?;
        scheduler.start().await;

        info!(
            max_concurrent = settings.max_concurrent_transfers,
            wifi_only = settings.wifi_only,
            ?recovery,
            "offline content ready"
        );
        Ok(Self {
            settings,
            tasks,
            records,
            content,
            scheduler,
            network,
            events,
            recovery,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &OfflineSettings {
        &self.settings
    }

    /// What startup recovery found.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    #[must_use]
    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    #[must_use]
    pub fn content_store(&self) -> &ContentStore {
        &self.content
    }

    /// Subscribes to progress and status events.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        self.events.subscribe(filter)
    }

    /// Records a download request and queues one task per unit.
    ///
    /// Idempotent: units already stored are not transferred again, units in
    /// flight are joined, failed units restart. Units cached in the ephemeral
    /// tier are promoted instead of re-downloaded.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::InvalidRequest`] for an empty resource id or a
    /// malformed unit (nothing is recorded in that case), otherwise a store
    /// or scheduler error.
    #[instrument(skip(self, units), fields(units = units.len()))]
    pub async fn request_download(
        &self,
        resource_id: &str,
        units: &[UnitRequest],
        priority: Priority,
    ) -> Result<RequestReceipt, OfflineError> {
        if resource_id.is_empty() {
            return Err(OfflineError::InvalidRequest("empty resource id".to_string()));
        }
        let ids = units
            .iter()
            .map(|unit| unit.task_id(resource_id))
            .collect::<Result<Vec<_>, _>>()?;

        let expires_at = self.settings.expires_at(now_millis());
        self.records
            .upsert_requested(resource_id, priority, expires_at)
            .await?;

        let mut tickets = Vec::with_capacity(ids.len());
        let mut seen = BTreeSet::new();
        for id in ids {
            if !seen.insert(id.storage_key()) {
                continue;
            }
            let ticket = self
                .scheduler
                .enqueue(EnqueueRequest {
                    id,
                    tier: Tier::Persistent,
                    priority,
                })
                .await?;
            tickets.push(ticket);
        }

        self.scheduler.refresh_record(resource_id).await;
        let record = self
            .records
            .get(resource_id)
            .await?
            .ok_or_else(|| crate::store::StoreError::RecordNotFound(resource_id.to_string()))?;

        let receipt = RequestReceipt {
            resource_id: resource_id.to_string(),
            record,
            tickets,
        };
        info!(
            resource_id,
            created = receipt.created(),
            attached = receipt.attached(),
            already_completed = receipt.already_completed(),
            "download requested"
        );
        Ok(receipt)
    }

    /// Caches the units following `current_unit` in the ephemeral tier.
    ///
    /// `units` lists the resource's units in reading order. Up to
    /// `auto_download_next_units` distinct unit ids after `current_unit` are
    /// queued at low priority. No content record is created.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::InvalidRequest`] for a malformed unit, or a
    /// scheduler error.
    #[instrument(skip(self, units))]
    pub async fn prefetch_after(
        &self,
        resource_id: &str,
        current_unit: &str,
        units: &[UnitRequest],
    ) -> Result<Vec<TaskTicket>, OfflineError> {
        let limit = self.settings.auto_download_next_units as usize;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(position) = units
            .iter()
            .position(|unit| unit.unit_id.as_deref() == Some(current_unit))
        else {
            debug!("current unit not in list; nothing to prefetch");
            return Ok(Vec::new());
        };

        let mut chosen: Vec<&str> = Vec::new();
        let mut tickets = Vec::new();
        for unit in &units[position..] {
            let Some(unit_id) = unit.unit_id.as_deref() else {
                continue;
            };
            if unit_id == current_unit {
                continue;
            }
            if !chosen.contains(&unit_id) {
                if chosen.len() == limit {
                    break;
                }
                chosen.push(unit_id);
            }
            let ticket = self
                .scheduler
                .enqueue(EnqueueRequest {
                    id: unit.task_id(resource_id)?,
                    tier: Tier::Ephemeral,
                    priority: Priority::Low,
                })
                .await?;
            tickets.push(ticket);
        }
        debug!(units = ?chosen, "prefetch queued");
        Ok(tickets)
    }

    /// Pauses every unfinished unit of a resource.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Scheduler`] if the pause cannot be recorded.
    pub async fn pause(&self, resource_id: &str) -> Result<usize, OfflineError> {
        Ok(self.scheduler.pause_resource(resource_id).await?)
    }

    /// Resumes the paused units of a resource.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Scheduler`] if the resume cannot be recorded.
    pub async fn resume(&self, resource_id: &str) -> Result<usize, OfflineError> {
        Ok(self.scheduler.resume_resource(resource_id).await?)
    }

    /// Cancels every unfinished unit of a resource. Completed units stay.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Scheduler`] if the cancellation cannot be recorded.
    pub async fn cancel(&self, resource_id: &str) -> Result<usize, OfflineError> {
        Ok(self.scheduler.cancel_resource(resource_id).await?)
    }

    /// Re-queues failed units of a resource with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Scheduler`] if the tasks cannot be reset.
    pub async fn retry_failed(&self, resource_id: &str) -> Result<usize, OfflineError> {
        Ok(self.scheduler.retry_failed(resource_id).await?)
    }

    /// Cancels in-flight units, deletes every stored file of the resource from
    /// both tiers and forgets its record. Returns how many files were deleted.
    ///
    /// # Errors
    ///
    /// Returns a scheduler or store error if the deletion cannot complete.
    #[instrument(skip(self))]
    pub async fn delete(&self, resource_id: &str) -> Result<usize, OfflineError> {
        let files = self.scheduler.remove_resource(resource_id).await?;
        let had_record = self.records.remove(resource_id).await?;
        self.events.emit(TransferEvent::ResourceRemoved {
            resource_id: resource_id.to_string(),
        });
        info!(resource_id, files, had_record, "resource deleted");
        Ok(files)
    }

    /// Whether a resource (every requested chapter) or one of its units
    /// (every requested kind) is stored locally.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Store`] if the task store cannot be read.
    pub async fn is_available_offline(
        &self,
        resource_id: &str,
        unit_id: Option<&str>,
    ) -> Result<bool, OfflineError> {
        let tasks = self.tasks.list_for_resource(resource_id).await?;
        let relevant: Vec<&TransferTask> = match unit_id {
            Some(unit) => tasks
                .iter()
                .filter(|task| task.id.sub_resource_id.as_deref() == Some(unit))
                .collect(),
            None if tasks.iter().any(|task| task.id.kind.is_chapter()) => {
                tasks.iter().filter(|task| task.id.kind.is_chapter()).collect()
            }
            None => tasks.iter().collect(),
        };
        if relevant.is_empty() {
            return Ok(false);
        }
        for task in relevant {
            if task.status != TaskStatus::Completed
                || self.content.tier_of(&task.id).await.is_none()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Completion of a resource in `0.0..=1.0`, or `None` when nothing was
    /// requested for it.
    ///
    /// Byte-based when every chapter's size is known, otherwise
    /// `completed_units / total_units`.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Store`] if the task store cannot be read.
    pub async fn progress(&self, resource_id: &str) -> Result<Option<f64>, OfflineError> {
        let tasks = self.tasks.list_for_resource(resource_id).await?;
        if !tasks.iter().any(|task| task.id.kind.is_chapter()) {
            return Ok(None);
        }
        Ok(Some(
            crate::store::RecordAggregate::from_tasks(&tasks).fraction(),
        ))
    }

    /// Bytes per tier and free space on the device holding the root.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Content`] if a tier cannot be walked or
    /// [`OfflineError::FreeSpace`] if the device cannot be queried.
    pub async fn storage_summary(&self) -> Result<StorageSummary, OfflineError> {
        let persistent_bytes = self.content.size_of_tier(Tier::Persistent).await?;
        let ephemeral_bytes = self.content.size_of_tier(Tier::Ephemeral).await?;
        let root = self.content.root().to_path_buf();
        let available_device_bytes =
            fs2::available_space(&root).map_err(|source| OfflineError::FreeSpace {
                path: root.clone(),
                source,
            })?;
        Ok(StorageSummary {
            persistent_bytes,
            ephemeral_bytes,
            available_device_bytes,
        })
    }

    /// Readable path of a stored unit, preferring the persistent tier.
    ///
    /// Refreshes the resource's last-access time.
    pub async fn local_path(&self, id: &TaskId) -> Option<PathBuf> {
        let path = self.content.local_path(id).await?;
        match self.records.touch(&id.resource_id, now_millis()).await {
            Ok(()) | Err(crate::store::StoreError::RecordNotFound(_)) => {}
            Err(err) => warn!(task = %id, error = %err, "failed to record access"),
        }
        Some(path)
    }

    /// Content record of a resource.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Store`] if the query fails.
    pub async fn record(&self, resource_id: &str) -> Result<Option<ContentRecord>, OfflineError> {
        Ok(self.records.get(resource_id).await?)
    }

    /// Every content record.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Store`] if the query fails.
    pub async fn records(&self) -> Result<Vec<ContentRecord>, OfflineError> {
        Ok(self.records.list().await?)
    }

    /// Tasks of a resource, in admission order.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Store`] if the query fails.
    pub async fn tasks(&self, resource_id: &str) -> Result<Vec<TransferTask>, OfflineError> {
        Ok(self.tasks.list_for_resource(resource_id).await?)
    }

    /// Deletes resources whose retention period has passed.
    ///
    /// # Errors
    ///
    /// Returns the first error hit; resources deleted before it stay deleted.
    #[instrument(skip(self))]
    pub async fn evict_expired(&self) -> Result<Vec<String>, OfflineError> {
        let expired = self.records.list_expired(now_millis()).await?;
        for resource_id in &expired {
            self.delete(resource_id).await?;
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired resources evicted");
        }
        Ok(expired)
    }

    /// Evicts cached payloads above the ephemeral budget.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Scheduler`] if eviction fails.
    pub async fn trim_cache(&self) -> Result<Vec<TaskId>, OfflineError> {
        Ok(self.scheduler.trim_cache().await?)
    }

    /// Re-checks the content index against the filesystem.
    ///
    /// Safe while transfers run: commits that are moving a file finish first.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Content`] if a tier cannot be scanned.
    pub async fn reconcile(&self) -> Result<ReconcileReport, OfflineError> {
        Ok(self.content.reconcile().await?)
    }

    /// Pauses running transfers (keeping resume data) and stops the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`OfflineError::Scheduler`] if the scheduler had already stopped.
    pub async fn shutdown(&self) -> Result<(), OfflineError> {
        Ok(self.scheduler.shutdown().await?)
    }
}
