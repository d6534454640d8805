//! Restart tests: state written by one `OfflineContent` must be picked up
//! by the next one opened on the same directory.

use std::sync::Arc;
use std::time::Duration;

use offline_content::api::ManifestContentApi;
use offline_content::store::{NewTask, RecordStatus, RecordStore, TaskStore};
use offline_content::transfer::{HttpTransport, TransferExecutor};
use offline_content::{Connectivity, Priority, TaskId, TaskOutcome, TaskStatus, Tier, UnitRequest};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::fixtures::{fast_settings, open_file_db, open_offline, payload};
use support::socket_guard::{should_skip_socket_bound_test, socket_skip_return, start_mock_server_or_skip};
use support::stall_server::{ResumeMode, StallServer};

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return socket_skip_return();
        };
        mock_server
    }};
}

/// Writes a task row as a killed process would have left it.
async fn leave_downloading(root: &std::path::Path, id: &TaskId, url: Option<String>) {
    let db = open_file_db(root).await;
    RecordStore::new(db.clone())
        .upsert_requested(&id.resource_id, Priority::Normal, None)
        .await
        .unwrap();
    let tasks = TaskStore::new(db.clone());
    tasks
        .insert(&NewTask {
            id: id.clone(),
            source_location: url,
            destination_tier: Tier::Persistent,
            priority: Priority::Normal,
            bytes_total: None,
            max_retries: 3,
        })
        .await
        .unwrap();
    tasks.mark_downloading(id).await.unwrap();
    db.close().await;
}

#[tokio::test]
async fn test_shutdown_mid_transfer_resumes_after_reopen() {
    if should_skip_socket_bound_test() {
        return;
    }
    let body = payload(10_000, 11);
    let mut server = StallServer::start(body.clone(), 4_000, ResumeMode::Honour, Vec::new()).await;
    let id = TaskId::chapter_audio("book", "1");
    let api = Arc::new(ManifestContentApi::new());
    api.set_source(id.clone(), server.url.clone(), Some(10_000));

    let dir = TempDir::new().unwrap();
    {
        let offline =
            open_offline(dir.path(), fast_settings(), Arc::clone(&api), Connectivity::Wifi).await;
        let receipt = offline
            .request_download("book", &[UnitRequest::audio("1")], Priority::Normal)
            .await
            .unwrap();
        server.wait_stalled().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        offline.shutdown().await.unwrap();

        let outcomes = receipt.wait_all().await;
        assert!(matches!(outcomes[0].1, TaskOutcome::Interrupted));
        let task = offline.tasks("book").await.unwrap().remove(0);
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.bytes_transferred, 4_000);
    }

    let offline = open_offline(dir.path(), fast_settings(), api, Connectivity::Wifi).await;
    assert_eq!(offline.recovery_report().resumable, 1);
    let outcomes = offline
        .request_download("book", &[UnitRequest::audio("1")], Priority::Normal)
        .await
        .unwrap()
        .wait_all()
        .await;
    let TaskOutcome::Completed { path } = &outcomes[0].1 else {
        panic!("expected completion: {outcomes:?}");
    };
    assert_eq!(std::fs::read(path).unwrap(), body);
    assert_eq!(
        server.ranges.lock().unwrap().as_slice(),
        &[Some("bytes=4000-".to_string())]
    );
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_killed_download_restarts_from_zero() {
    let mock_server = require_mock_server!();
    let body = payload(2_048, 12);
    Mock::given(method("GET"))
        .and(path("/ch1.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let id = TaskId::chapter_audio("book", "1");
    leave_downloading(dir.path(), &id, Some(format!("{}/ch1.mp3", mock_server.uri()))).await;

    let offline = open_offline(
        dir.path(),
        fast_settings(),
        Arc::new(ManifestContentApi::new()),
        Connectivity::Wifi,
    )
    .await;
    assert_eq!(offline.recovery_report().restarted, 1);

    for _ in 0..250 {
        if offline.is_available_offline("book", Some("1")).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let path = offline.local_path(&id).await.expect("payload stored");
    assert_eq!(std::fs::read(path).unwrap(), body);
    let record = offline.record("book").await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Completed);
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_finished_staging_file_is_committed_on_open() {
    let dir = TempDir::new().unwrap();
    let id = TaskId::chapter_text("book", "1");
    leave_downloading(dir.path(), &id, None).await;

    let executor = TransferExecutor::new(
        HttpTransport::new().unwrap(),
        dir.path().join("staging"),
        Duration::from_millis(50),
    );
    executor.stage_inline(&id, b"<p>one</p>").await.unwrap();

    let offline = open_offline(
        dir.path(),
        fast_settings(),
        Arc::new(ManifestContentApi::new()),
        Connectivity::None,
    )
    .await;
    assert_eq!(offline.recovery_report().committed, 1);
    assert!(offline.is_available_offline("book", Some("1")).await.unwrap());
    let path = offline.local_path(&id).await.unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"<p>one</p>");
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_completed_downloads_survive_restart() {
    let dir = TempDir::new().unwrap();
    let id = TaskId::chapter_text("book", "1");
    let api = Arc::new(ManifestContentApi::new());
    api.set_inline_text(id.clone(), "<p>kept</p>");

    {
        let offline =
            open_offline(dir.path(), fast_settings(), Arc::clone(&api), Connectivity::Wifi).await;
        offline
            .request_download("book", &[UnitRequest::text("1")], Priority::Normal)
            .await
            .unwrap()
            .wait_all()
            .await;
        offline.shutdown().await.unwrap();
    }

    let offline = open_offline(dir.path(), fast_settings(), api, Connectivity::None).await;
    assert!(offline.is_available_offline("book", Some("1")).await.unwrap());
    let receipt = offline
        .request_download("book", &[UnitRequest::text("1")], Priority::Normal)
        .await
        .unwrap();
    assert_eq!(receipt.already_completed(), 1);
    offline.shutdown().await.unwrap();
}
