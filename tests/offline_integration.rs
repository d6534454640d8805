//! Integration tests for `OfflineContent` against mock HTTP sources.
//!
//! These exercise the whole stack (façade, scheduler, executor, content
//! store, SQLite) with the scheduler's real timing.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use offline_content::api::ManifestContentApi;
use offline_content::store::{PauseReason, RecordStatus, TransferTask};
use offline_content::transfer::FailureType;
use offline_content::{
    Connectivity, OfflineContent, Priority, TaskId, TaskOutcome, TaskStatus, Tier, UnitRequest,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, Respond, ResponseTemplate};

mod support;
use support::fixtures::{fast_settings, open_offline, payload};
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

/// Tracks how many requests are in flight at once.
///
/// The blocking sleep runs on wiremock's server threads, so it holds the
/// request open without stalling the test runtime.
struct ConcurrencyTrackingResponder {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay_ms: u64,
    body: Vec<u8>,
}

impl Respond for ConcurrencyTrackingResponder {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(self.delay_ms));
        self.current.fetch_sub(1, Ordering::SeqCst);
        ResponseTemplate::new(200).set_body_bytes(self.body.clone())
    }
}

async fn wait_for_task<F>(offline: &OfflineContent, id: &TaskId, done: F)
where
    F: Fn(TaskStatus) -> bool,
{
    for _ in 0..500 {
        let tasks = offline.tasks(&id.resource_id).await.unwrap();
        if tasks.iter().any(|task| &task.id == id && done(task.status)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {id} never reached the expected status");
}

async fn wait_for_tasks<F>(offline: &OfflineContent, resource_id: &str, done: F) -> Vec<TransferTask>
where
    F: Fn(&[TransferTask]) -> bool,
{
    for _ in 0..500 {
        let tasks = offline.tasks(resource_id).await.unwrap();
        if done(&tasks) {
            return tasks;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tasks of {resource_id} never reached the expected state");
}

fn count(tasks: &[TransferTask], status: TaskStatus) -> usize {
    tasks.iter().filter(|task| task.status == status).count()
}

#[tokio::test]
async fn test_concurrency_never_exceeds_cap() {
    let mock_server = require_mock_server!();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    Mock::given(method("GET"))
        .respond_with(ConcurrencyTrackingResponder {
            current: Arc::clone(&current),
            peak: Arc::clone(&peak),
            delay_ms: 100,
            body: payload(256, 1),
        })
        .mount(&mock_server)
        .await;

    let api = Arc::new(ManifestContentApi::new());
    let units: Vec<UnitRequest> = (1..=10)
        .map(|i| {
            api.set_source(
                TaskId::chapter_audio("book", i.to_string()),
                format!("{}/ch{i}.mp3", mock_server.uri()),
                None,
            );
            UnitRequest::audio(i.to_string())
        })
        .collect();

    let dir = TempDir::new().unwrap();
    let offline = open_offline(dir.path(), fast_settings(), api, Connectivity::Wifi).await;
    let receipt = offline
        .request_download("book", &units, Priority::Normal)
        .await
        .unwrap();
    assert_eq!(receipt.created(), 10);

    let outcomes = receipt.wait_all().await;
    assert!(
        outcomes
            .iter()
            .all(|(_, outcome)| matches!(outcome, TaskOutcome::Completed { .. }))
    );
    let observed = peak.load(Ordering::SeqCst);
    assert!(observed <= 3, "peak concurrency {observed} exceeds cap of 3");

    let record = offline.record("book").await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Completed);
    assert_eq!(record.completed_units, 10);
    assert!(offline.is_available_offline("book", None).await.unwrap());
    assert_eq!(offline.progress("book").await.unwrap(), Some(1.0));
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_requests_share_one_transfer() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/ch1.mp3"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(payload(1024, 2))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let api = Arc::new(ManifestContentApi::new());
    api.set_source(
        TaskId::chapter_audio("book", "1"),
        format!("{}/ch1.mp3", mock_server.uri()),
        Some(1024),
    );

    let dir = TempDir::new().unwrap();
    let offline = open_offline(dir.path(), fast_settings(), api, Connectivity::Wifi).await;
    let units = [UnitRequest::audio("1")];
    let first = offline
        .request_download("book", &units, Priority::Normal)
        .await
        .unwrap();
    let second = offline
        .request_download("book", &units, Priority::High)
        .await
        .unwrap();
    assert_eq!(first.created(), 1);
    assert_eq!(second.attached(), 1);

    let (a, b) = tokio::join!(first.wait_all(), second.wait_all());
    let (TaskOutcome::Completed { path: p1 }, TaskOutcome::Completed { path: p2 }) =
        (&a[0].1, &b[0].1)
    else {
        panic!("both requests should complete: {a:?} {b:?}");
    };
    assert_eq!(p1, p2);

    let third = offline
        .request_download("book", &units, Priority::Normal)
        .await
        .unwrap();
    assert_eq!(third.already_completed(), 1);
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_fail_only_that_unit() {
    let mock_server = require_mock_server!();
    for i in [1, 3] {
        Mock::given(method("GET"))
            .and(path(format!("/ch{i}.mp3")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(128, i)))
            .mount(&mock_server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/ch2.mp3"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ch2.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(128, 2)))
        .mount(&mock_server)
        .await;

    let api = Arc::new(ManifestContentApi::new());
    for i in 1..=3 {
        api.set_source(
            TaskId::chapter_audio("book", i.to_string()),
            format!("{}/ch{i}.mp3", mock_server.uri()),
            None,
        );
    }

    let dir = TempDir::new().unwrap();
    let offline = open_offline(dir.path(), fast_settings(), api, Connectivity::Wifi).await;
    let units: Vec<_> = (1..=3).map(|i| UnitRequest::audio(i.to_string())).collect();
    let outcomes = offline
        .request_download("book", &units, Priority::Normal)
        .await
        .unwrap()
        .wait_all()
        .await;

    let failed = TaskId::chapter_audio("book", "2");
    for (id, outcome) in &outcomes {
        if id == &failed {
            assert!(matches!(
                outcome,
                TaskOutcome::Failed {
                    failure: FailureType::Transient,
                    ..
                }
            ));
        } else {
            assert!(matches!(outcome, TaskOutcome::Completed { .. }), "{id}: {outcome:?}");
        }
    }

    let task = offline
        .tasks("book")
        .await
        .unwrap()
        .into_iter()
        .find(|task| task.id == failed)
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert!(task.last_error.is_some());

    let record = offline.record("book").await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.completed_units, 2);

    // The source recovers; an explicit retry starts over with a fresh budget.
    assert_eq!(offline.retry_failed("book").await.unwrap(), 1);
    wait_for_task(&offline, &failed, |status| status == TaskStatus::Completed).await;
    let record = offline.record("book").await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Completed);
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_network_loss_pauses_without_spending_retries() {
    if should_skip_socket_bound_test() {
        return;
    }
    let body = payload(10_000, 4);
    let mut server = StallServer::start(body.clone(), 4_000, ResumeMode::Honour, Vec::new()).await;

    let id = TaskId::chapter_audio("book", "1");
    let api = Arc::new(ManifestContentApi::new());
    api.set_source(id.clone(), server.url.clone(), Some(10_000));

    let dir = TempDir::new().unwrap();
    let offline = open_offline(dir.path(), fast_settings(), api, Connectivity::Wifi).await;
    let receipt = offline
        .request_download("book", &[UnitRequest::audio("1")], Priority::Normal)
        .await
        .unwrap();
    server.wait_stalled().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    offline.network().set_connectivity(Connectivity::None);
    wait_for_task(&offline, &id, |status| status == TaskStatus::Paused).await;
    let task = offline.tasks("book").await.unwrap().remove(0);
    assert_eq!(task.pause_reason, Some(PauseReason::Network));
    assert_eq!(task.retry_count, 0);

    offline.network().set_connectivity(Connectivity::Wifi);
    let outcomes = receipt.wait_all().await;
    let TaskOutcome::Completed { path } = &outcomes[0].1 else {
        panic!("expected completion: {outcomes:?}");
    };
    assert_eq!(std::fs::read(path).unwrap(), body);

    let task = offline.tasks("book").await.unwrap().remove(0);
    assert_eq!(task.retry_count, 0);
    assert_eq!(
        server.ranges.lock().unwrap().as_slice(),
        &[Some("bytes=4000-".to_string())]
    );
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_wifi_only_holds_work_on_cellular() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/ch1.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(64, 8)))
        .mount(&mock_server)
        .await;

    let id = TaskId::chapter_audio("book", "1");
    let api = Arc::new(ManifestContentApi::new());
    api.set_source(id.clone(), format!("{}/ch1.mp3", mock_server.uri()), None);

    let dir = TempDir::new().unwrap();
    let settings = offline_content::OfflineSettings {
        wifi_only: true,
        ..fast_settings()
    };
    let offline = open_offline(dir.path(), settings, api, Connectivity::Cellular).await;
    let receipt = offline
        .request_download("book", &[UnitRequest::audio("1")], Priority::Normal)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(offline.tasks("book").await.unwrap()[0].status, TaskStatus::Queued);
    assert!(mock_server.received_requests().await.unwrap().is_empty());

    offline.network().set_connectivity(Connectivity::Wifi);
    let outcomes = receipt.wait_all().await;
    assert!(matches!(outcomes[0].1, TaskOutcome::Completed { .. }));
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_mid_download_leaves_nothing_behind() {
    if should_skip_socket_bound_test() {
        return;
    }
    let mut server =
        StallServer::start(payload(10_000, 6), 4_000, ResumeMode::Honour, Vec::new()).await;

    let id = TaskId::chapter_audio("book", "1");
    let api = Arc::new(ManifestContentApi::new());
    api.set_source(id.clone(), server.url.clone(), None);
    api.set_inline_text(TaskId::chapter_text("book", "1"), "<p>one</p>");

    let dir = TempDir::new().unwrap();
    let offline = open_offline(dir.path(), fast_settings(), api, Connectivity::Wifi).await;
    let text = offline
        .request_download("book", &[UnitRequest::text("1")], Priority::Normal)
        .await
        .unwrap()
        .wait_all()
        .await;
    assert!(matches!(text[0].1, TaskOutcome::Completed { .. }));

    let receipt = offline
        .request_download("book", &[UnitRequest::audio("1")], Priority::Normal)
        .await
        .unwrap();
    server.wait_stalled().await;

    let files = offline.delete("book").await.unwrap();
    assert_eq!(files, 1);
    let outcomes = receipt.wait_all().await;
    assert!(matches!(outcomes[0].1, TaskOutcome::Removed));

    assert!(offline.record("book").await.unwrap().is_none());
    assert!(offline.tasks("book").await.unwrap().is_empty());
    assert!(offline.local_path(&TaskId::chapter_text("book", "1")).await.is_none());
    // The stopped transfer discards its staged bytes as it settles.
    let staging = offline.content_store().staging_dir();
    let staged = || {
        std::fs::read_dir(&staging)
            .map(|entries| entries.count())
            .unwrap_or(0)
    };
    for _ in 0..100 {
        if staged() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(staged(), 0, "staging should be empty after delete");
    let summary = offline.storage_summary().await.unwrap();
    assert_eq!(summary.persistent_bytes, 0);
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_prefetched_units_land_in_cache_and_promote_on_request() {
    let mock_server = require_mock_server!();
    for i in 1..=3 {
        Mock::given(method("GET"))
            .and(path(format!("/ch{i}.mp3")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(100, i)))
            .mount(&mock_server)
            .await;
    }
    let api = Arc::new(ManifestContentApi::new());
    for i in 1..=3 {
        api.set_source(
            TaskId::chapter_audio("book", i.to_string()),
            format!("{}/ch{i}.mp3", mock_server.uri()),
            Some(100),
        );
    }

    let dir = TempDir::new().unwrap();
    let settings = offline_content::OfflineSettings {
        auto_download_next_units: 2,
        ..fast_settings()
    };
    let offline = open_offline(dir.path(), settings, Arc::clone(&api), Connectivity::Wifi).await;
    let all: Vec<_> = (1..=3).map(|i| UnitRequest::audio(i.to_string())).collect();
    let tickets = offline.prefetch_after("book", "1", &all).await.unwrap();
    assert_eq!(tickets.len(), 2);
    for ticket in tickets {
        assert!(matches!(ticket.wait().await, TaskOutcome::Completed { .. }));
    }

    let cached = TaskId::chapter_audio("book", "2");
    assert_eq!(offline.content_store().tier_of(&cached).await, Some(Tier::Ephemeral));

    let calls_before = mock_server.received_requests().await.unwrap().len();
    let promoted = offline
        .request_download("book", &[UnitRequest::audio("2")], Priority::Normal)
        .await
        .unwrap();
    assert_eq!(promoted.already_completed(), 1);
    assert_eq!(offline.content_store().tier_of(&cached).await, Some(Tier::Persistent));
    assert_eq!(
        mock_server.received_requests().await.unwrap().len(),
        calls_before,
        "promotion must not transfer again"
    );
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ten_units_run_three_at_a_time() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(payload(64, 3))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&mock_server)
        .await;

    let api = Arc::new(ManifestContentApi::new());
    let units: Vec<UnitRequest> = (1..=10)
        .map(|i| {
            api.set_source(
                TaskId::chapter_audio("book", i.to_string()),
                format!("{}/ch{i}.mp3", mock_server.uri()),
                None,
            );
            UnitRequest::audio(i.to_string())
        })
        .collect();

    let dir = TempDir::new().unwrap();
    let offline = open_offline(dir.path(), fast_settings(), api, Connectivity::Wifi).await;
    offline
        .request_download("book", &units, Priority::Normal)
        .await
        .unwrap();

    let tasks = wait_for_tasks(&offline, "book", |tasks| {
        count(tasks, TaskStatus::Downloading) == 3
    })
    .await;
    assert_eq!(count(&tasks, TaskStatus::Queued), 7);
    assert_eq!(offline.record("book").await.unwrap().unwrap().total_units, 10);
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expired_source_is_resolved_again() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/ch1.mp3"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ch1.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(256, 5)))
        .mount(&mock_server)
        .await;

    let id = TaskId::chapter_audio("book", "1");
    let api = Arc::new(ManifestContentApi::new());
    api.set_source(id.clone(), format!("{}/ch1.mp3", mock_server.uri()), None);

    let dir = TempDir::new().unwrap();
    let offline = open_offline(dir.path(), fast_settings(), Arc::clone(&api), Connectivity::Wifi).await;
    let outcomes = offline
        .request_download("book", &[UnitRequest::audio("1")], Priority::Normal)
        .await
        .unwrap()
        .wait_all()
        .await;
    assert!(matches!(outcomes[0].1, TaskOutcome::Completed { .. }), "{outcomes:?}");

    let task = offline.tasks("book").await.unwrap().remove(0);
    assert_eq!(task.retry_count, 1);
    assert!(!task.needs_resolve);
    // Once for the first attempt, once more after the 403.
    assert_eq!(api.call_count(), 2);
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_storage_failure_fails_without_spending_retries() {
    let id = TaskId::chapter_text("book", "1");
    let api = Arc::new(ManifestContentApi::new());
    api.set_inline_text(id.clone(), "<p>one</p>");

    let dir = TempDir::new().unwrap();
    let offline = open_offline(dir.path(), fast_settings(), Arc::clone(&api), Connectivity::Wifi).await;
    // A plain file where the resource directory belongs makes every commit fail.
    let blocker = offline
        .content_store()
        .tier_dir(Tier::Persistent)
        .join(TaskId::resource_dir_name("book"));
    std::fs::write(&blocker, b"not a directory").unwrap();

    let outcomes = offline
        .request_download("book", &[UnitRequest::text("1")], Priority::Normal)
        .await
        .unwrap()
        .wait_all()
        .await;
    assert!(
        matches!(
            outcomes[0].1,
            TaskOutcome::Failed {
                failure: FailureType::Storage,
                ..
            }
        ),
        "{outcomes:?}"
    );

    let task = offline.tasks("book").await.unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
    assert_eq!(api.call_count(), 1);
    offline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cover_only_resource_completes() {
    let mock_server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/cover.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload(512, 7)))
        .mount(&mock_server)
        .await;

    let api = Arc::new(ManifestContentApi::new());
    api.set_source(
        TaskId::cover("book"),
        format!("{}/cover.jpg", mock_server.uri()),
        Some(512),
    );

    let dir = TempDir::new().unwrap();
    let offline = open_offline(dir.path(), fast_settings(), api, Connectivity::Wifi).await;
    let outcomes = offline
        .request_download("book", &[UnitRequest::cover()], Priority::Normal)
        .await
        .unwrap()
        .wait_all()
        .await;
    assert!(matches!(outcomes[0].1, TaskOutcome::Completed { .. }));

    let record = offline.record("book").await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Completed);
    assert!(offline.is_available_offline("book", None).await.unwrap());
    offline.shutdown().await.unwrap();
}
