//! Builders for an [`OfflineContent`] rooted in a temp directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use offline_content::api::ManifestContentApi;
use offline_content::{Connectivity, Database, NetworkMonitor, OfflineContent, OfflineSettings};

/// Settings with short retry delays so failure paths finish quickly.
pub fn fast_settings() -> OfflineSettings {
    OfflineSettings {
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(40),
        retry_jitter: Duration::ZERO,
        progress_interval: Duration::from_millis(50),
        connect_timeout_secs: 5,
        read_timeout_secs: 30,
        ..OfflineSettings::default()
    }
}

pub async fn open_file_db(root: &Path) -> Database {
    Database::new(&root.join("offline.db")).await.unwrap()
}

pub async fn open_offline(
    root: &Path,
    settings: OfflineSettings,
    api: Arc<ManifestContentApi>,
    connectivity: Connectivity,
) -> OfflineContent {
    let db = open_file_db(root).await;
    OfflineContent::open(
        settings,
        db,
        root,
        api,
        NetworkMonitor::new(connectivity, false),
    )
    .await
    .unwrap()
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
