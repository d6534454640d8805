//! Filesystem-backed content store with a persisted in-memory index.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::{ContentError, Result, Tier};
use crate::clock::now_millis;
use crate::store::{IndexEntry, IndexStore, TaskId};

const STAGING_DIR: &str = "staging";
const TEMP_MARKER: &str = ".tmp-";

/// Outcome of a [`ContentStore::reconcile`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Index entries examined.
    pub entries_checked: usize,
    /// Entries dropped because their file vanished.
    pub entries_dropped: usize,
    /// Entries whose recorded size disagreed with the file.
    pub sizes_fixed: usize,
    /// Files on disk that no index entry claims.
    pub orphans_removed: usize,
    /// Leftover temp files from interrupted atomic writes.
    pub temp_files_removed: usize,
}

type IndexKey = (Tier, String);

/// Tier-aware file storage.
///
/// Every mutation goes through this type, which keeps the [`DashMap`] index,
/// the persisted [`IndexStore`] and the filesystem in step. A file key is the
/// owning task's [`TaskId::storage_key`].
///
/// Mutations hold `gate` shared; [`ContentStore::reconcile`] holds it
/// exclusively, so a file that is mid-move is never mistaken for an orphan.
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    index: DashMap<IndexKey, IndexEntry>,
    persisted: IndexStore,
    gate: RwLock<()>,
}

impl ContentStore {
    /// Opens the store rooted at `root`, creating the tier directories.
    ///
    /// The persisted index is trusted for identity; only the top-level
    /// resource directories of each tier are listed to drop entries whose
    /// resource directory has been purged.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Io`] if the directories cannot be created or
    /// listed, or [`ContentError::Store`] if the index cannot be loaded.
    #[instrument(skip(root, persisted), fields(root = %root.as_ref().display()))]
    pub async fn open(root: impl AsRef<Path>, persisted: IndexStore) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let store = Self {
            root,
            index: DashMap::new(),
            persisted,
            gate: RwLock::new(()),
        };

        for dir in [
            store.tier_dir(Tier::Persistent),
            store.tier_dir(Tier::Ephemeral),
            store.staging_dir(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| ContentError::io(&dir, e))?;
        }

        let mut present: HashSet<(Tier, String)> = HashSet::new();
        for tier in Tier::ALL {
            for name in list_dir_names(&store.tier_dir(tier)).await? {
                present.insert((tier, name));
            }
        }

        let mut dropped = 0usize;
        for entry in store.persisted.load_all().await? {
            let dir = TaskId::resource_dir_name(&entry.id.resource_id);
            if present.contains(&(entry.tier, dir)) {
                store.index.insert((entry.tier, entry.key()), entry);
            } else {
                store.persisted.remove(entry.tier, &entry.key()).await?;
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(dropped, "dropped index entries whose resource directory is gone");
        }

        info!(entries = store.index.len(), "content store opened");
        Ok(store)
    }

    /// Storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a tier.
    #[must_use]
    pub fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.root.join(tier.dir_name())
    }

    /// Directory transfers stream into before commit.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Final path of a file in a tier, whether or not it exists.
    #[must_use]
    pub fn path_for(&self, tier: Tier, id: &TaskId) -> PathBuf {
        self.tier_dir(tier)
            .join(TaskId::resource_dir_name(&id.resource_id))
            .join(format!("{}.{}", id.storage_key(), id.kind.file_extension()))
    }

    /// True when the file is indexed in `tier` and still present on disk.
    ///
    /// An indexed file that has disappeared (e.g. the OS purged the cache) is
    /// dropped from the index.
    pub async fn exists(&self, tier: Tier, id: &TaskId) -> bool {
        let key = id.storage_key();
        if !self.index.contains_key(&(tier, key.clone())) {
            return false;
        }
        let path = self.path_for(tier, id);
        match fs::try_exists(&path).await {
            Ok(true) => true,
            Ok(false) | Err(_) => {
                warn!(tier = %tier, id = %id, "indexed file missing on disk; dropping entry");
                self.forget(tier, &key).await;
                false
            }
        }
    }

    /// Tier a file currently lives in, checking persistent first.
    pub async fn tier_of(&self, id: &TaskId) -> Option<Tier> {
        for tier in Tier::ALL {
            if self.exists(tier, id).await {
                return Some(tier);
            }
        }
        None
    }

    /// Readable path of a file, preferring the persistent tier.
    pub async fn local_path(&self, id: &TaskId) -> Option<PathBuf> {
        let tier = self.tier_of(id).await?;
        Some(self.path_for(tier, id))
    }

    /// Indexed size of a file in a tier.
    #[must_use]
    pub fn indexed_size(&self, tier: Tier, id: &TaskId) -> Option<u64> {
        self.index
            .get(&(tier, id.storage_key()))
            .map(|entry| entry.size_bytes)
    }

    /// Atomically writes `bytes` as the file for `id` in `tier`.
    ///
    /// Data goes to a temp sibling, is synced, then renamed into place. Any
    /// copy in the other tier is removed.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Io`] on filesystem failure (no partial file is
    /// left at the final path) or [`ContentError::Store`] if the index write fails.
    #[instrument(skip(self, bytes), fields(tier = %tier, id = %id, len = bytes.len()))]
    pub async fn write(&self, tier: Tier, id: &TaskId, bytes: &[u8]) -> Result<PathBuf> {
        let _guard = self.gate.read().await;
        let dest = self.path_for(tier, id);
        ensure_parent(&dest).await?;

        let tmp = temp_sibling(&dest);
        if let Err(err) = write_synced(&tmp, bytes).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&tmp, &dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(ContentError::io(&dest, err));
        }

        self.record(tier, id, bytes.len() as u64).await
    }

    /// Moves a fully written staging file into `tier` as the file for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Io`] if the move fails or
    /// [`ContentError::Store`] if the index write fails.
    #[instrument(skip(self, staged), fields(tier = %tier, id = %id))]
    pub async fn commit(&self, tier: Tier, id: &TaskId, staged: &Path) -> Result<PathBuf> {
        let _guard = self.gate.read().await;
        let dest = self.path_for(tier, id);
        ensure_parent(&dest).await?;
        move_file(staged, &dest).await?;
        let size = fs::metadata(&dest)
            .await
            .map_err(|e| ContentError::io(&dest, e))?
            .len();
        self.record(tier, id, size).await
    }

    /// Moves a file from the ephemeral to the persistent tier.
    ///
    /// No-op when the file is already persistent.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::MissingEphemeral`] when there is no ephemeral
    /// copy to promote; the caller must download it again.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn promote(&self, id: &TaskId) -> Result<PathBuf> {
        let _guard = self.gate.read().await;
        if self.exists(Tier::Persistent, id).await {
            return Ok(self.path_for(Tier::Persistent, id));
        }
        if !self.exists(Tier::Ephemeral, id).await {
            return Err(ContentError::MissingEphemeral(id.to_string()));
        }

        let from = self.path_for(Tier::Ephemeral, id);
        let to = self.path_for(Tier::Persistent, id);
        ensure_parent(&to).await?;
        move_file(&from, &to).await?;
        let size = fs::metadata(&to)
            .await
            .map_err(|e| ContentError::io(&to, e))?
            .len();

        debug!(size, "promoted to persistent tier");
        self.record(Tier::Persistent, id, size).await
    }

    /// Deletes a file from a tier. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Io`] if the file exists but cannot be removed.
    #[instrument(skip(self), fields(tier = %tier, id = %id))]
    pub async fn delete(&self, tier: Tier, id: &TaskId) -> Result<bool> {
        let _guard = self.gate.read().await;
        let path = self.path_for(tier, id);
        let removed_file = remove_if_exists(&path).await?;
        let key = id.storage_key();
        let was_indexed = self.index.remove(&(tier, key.clone())).is_some();
        self.persisted.remove(tier, &key).await?;
        Ok(removed_file || was_indexed)
    }

    /// Deletes every file of a resource from both tiers.
    ///
    /// Returns the number of index entries removed.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Io`] if a resource directory cannot be removed.
    #[instrument(skip(self))]
    pub async fn delete_all(&self, resource_id: &str) -> Result<usize> {
        let _guard = self.gate.read().await;
        let dir_name = TaskId::resource_dir_name(resource_id);
        for tier in Tier::ALL {
            let dir = self.tier_dir(tier).join(&dir_name);
            match fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(ContentError::io(dir, err)),
            }
        }

        let before = self.index.len();
        self.index
            .retain(|_, entry| entry.id.resource_id != resource_id);
        let removed = before.saturating_sub(self.index.len());
        self.persisted.remove_resource(resource_id).await?;

        debug!(removed, "deleted resource files");
        Ok(removed)
    }

    /// Index entries belonging to a resource.
    #[must_use]
    pub fn entries_for(&self, resource_id: &str) -> Vec<IndexEntry> {
        self.index
            .iter()
            .filter(|entry| entry.id.resource_id == resource_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Bytes on disk under a tier directory.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Io`] if the blocking walk cannot be joined.
    pub async fn size_of_tier(&self, tier: Tier) -> Result<u64> {
        dir_size(self.tier_dir(tier)).await
    }

    /// Bytes on disk for a resource across both tiers.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Io`] if the blocking walk cannot be joined.
    pub async fn size_of_resource(&self, resource_id: &str) -> Result<u64> {
        let dir_name = TaskId::resource_dir_name(resource_id);
        let mut total = 0u64;
        for tier in Tier::ALL {
            total = total.saturating_add(dir_size(self.tier_dir(tier).join(&dir_name)).await?);
        }
        Ok(total)
    }

    /// Evicts the oldest ephemeral files until the tier fits in `limit_bytes`.
    ///
    /// Returns the ids that were evicted.
    ///
    /// # Errors
    ///
    /// Returns the first deletion error.
    #[instrument(skip(self))]
    pub async fn trim_ephemeral(&self, limit_bytes: u64) -> Result<Vec<TaskId>> {
        let mut entries: Vec<IndexEntry> = self
            .index
            .iter()
            .filter(|entry| entry.tier == Tier::Ephemeral)
            .map(|entry| entry.value().clone())
            .collect();
        let mut total: u64 = entries.iter().map(|entry| entry.size_bytes).sum();
        if total <= limit_bytes {
            return Ok(Vec::new());
        }

        entries.sort_by_key(|entry| entry.created_at);
        let mut evicted = Vec::new();
        for entry in entries {
            if total <= limit_bytes {
                break;
            }
            self.delete(Tier::Ephemeral, &entry.id).await?;
            total = total.saturating_sub(entry.size_bytes);
            evicted.push(entry.id);
        }

        info!(evicted = evicted.len(), remaining_bytes = total, "trimmed ephemeral tier");
        Ok(evicted)
    }

    /// Re-stats every indexed file and rebuilds the index from what is on disk.
    ///
    /// Entries whose file is gone are dropped, sizes are corrected, and files
    /// no entry claims (including interrupted temp files) are deleted. Waits
    /// for in-flight writes, commits and deletions to finish and holds off new
    /// ones until the pass is done.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Store`] if the persisted index cannot be updated.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let _exclusive = self.gate.write().await;
        let mut report = ReconcileReport::default();

        let snapshot: Vec<IndexEntry> = self
            .index
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for entry in snapshot {
            report.entries_checked += 1;
            let path = self.path_for(entry.tier, &entry.id);
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {
                    if meta.len() != entry.size_bytes {
                        let fixed = IndexEntry {
                            size_bytes: meta.len(),
                            ..entry
                        };
                        self.persisted.upsert(&fixed).await?;
                        self.index.insert((fixed.tier, fixed.key()), fixed);
                        report.sizes_fixed += 1;
                    }
                }
                _ => {
                    self.forget(entry.tier, &entry.key()).await;
                    report.entries_dropped += 1;
                }
            }
        }

        let claimed: HashSet<PathBuf> = self
            .index
            .iter()
            .map(|entry| self.path_for(entry.tier, &entry.id))
            .collect();
        for tier in Tier::ALL {
            for file in list_files(self.tier_dir(tier)).await? {
                if claimed.contains(&file) {
                    continue;
                }
                let is_temp = file
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.contains(TEMP_MARKER));
                match fs::remove_file(&file).await {
                    Ok(()) if is_temp => report.temp_files_removed += 1,
                    Ok(()) => report.orphans_removed += 1,
                    Err(err) => warn!(path = %file.display(), error = %err, "failed to remove orphan"),
                }
            }
        }

        info!(
            checked = report.entries_checked,
            dropped = report.entries_dropped,
            fixed = report.sizes_fixed,
            orphans = report.orphans_removed,
            temps = report.temp_files_removed,
            "content store reconciled"
        );
        Ok(report)
    }

    /// Makes `tier` the only tier holding `id` and indexes it.
    async fn record(&self, tier: Tier, id: &TaskId, size_bytes: u64) -> Result<PathBuf> {
        let other = tier.other();
        remove_if_exists(&self.path_for(other, id)).await?;

        let entry = IndexEntry {
            tier,
            id: id.clone(),
            size_bytes,
            created_at: now_millis(),
        };
        self.persisted.upsert(&entry).await?;
        let key = entry.key();
        self.index.remove(&(other, key.clone()));
        self.index.insert((tier, key), entry);

        Ok(self.path_for(tier, id))
    }

    async fn forget(&self, tier: Tier, key: &str) {
        self.index.remove(&(tier, key.to_string()));
        if let Err(err) = self.persisted.remove(tier, key).await {
            warn!(tier = %tier, error = %err, "failed to drop stale index entry");
        }
    }
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!("{name}{TEMP_MARKER}{:08x}", rand::random::<u32>()))
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ContentError::io(parent, e))?;
    }
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| ContentError::io(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| ContentError::io(path, e))?;
    file.sync_all().await.map_err(|e| ContentError::io(path, e))?;
    Ok(())
}

/// Renames `from` to `to`, falling back to copy + rename across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    let Err(rename_err) = fs::rename(from, to).await else {
        return Ok(());
    };
    if rename_err.kind() == io::ErrorKind::NotFound {
        return Err(ContentError::io(from, rename_err));
    }

    debug!(error = %rename_err, "rename failed, copying instead");
    let tmp = temp_sibling(to);
    if let Err(err) = fs::copy(from, &tmp).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(ContentError::io(to, err));
    }
    if let Err(err) = fs::rename(&tmp, to).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(ContentError::io(to, err));
    }
    remove_if_exists(from).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(ContentError::io(path, err)),
    }
}

async fn list_dir_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(names),
        Err(err) => return Err(ContentError::io(dir, err)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ContentError::io(dir, e))?
    {
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    Ok(names)
}

async fn list_files(dir: PathBuf) -> Result<Vec<PathBuf>> {
    let display = dir.clone();
    tokio::task::spawn_blocking(move || {
        WalkDir::new(&dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .collect()
    })
    .await
    .map_err(|e| ContentError::io(display, io::Error::other(e)))
}

async fn dir_size(dir: PathBuf) -> Result<u64> {
    let display = dir.clone();
    tokio::task::spawn_blocking(move || {
        WalkDir::new(&dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum::<u64>()
    })
    .await
    .map_err(|e| ContentError::io(display, io::Error::other(e)))
}
