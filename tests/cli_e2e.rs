//! End-to-end CLI tests for the `offline` binary.

#![allow(deprecated)]

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::{socket_skip_return, start_mock_server_or_skip};

/// Runs the binary against `data_dir` with no user config file in scope.
fn offline(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("offline").unwrap();
    cmd.env("XDG_CONFIG_HOME", data_dir.join("xdg-config"))
        .env_remove("RUST_LOG")
        .arg("--data-dir")
        .arg(data_dir);
    cmd
}

fn write_manifest(dir: &Path, json: &str) -> std::path::PathBuf {
    let manifest = dir.join("manifest.json");
    std::fs::write(&manifest, json).unwrap();
    manifest
}

#[test]
fn test_binary_help_displays_usage() {
    Command::cargo_bin("offline")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Download books and audiobooks"));
}

#[test]
fn test_binary_version_displays_name() {
    Command::cargo_bin("offline")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("offline"));
}

#[test]
fn test_binary_requires_subcommand() {
    Command::cargo_bin("offline")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_status_on_fresh_data_dir() {
    let dir = TempDir::new().unwrap();
    offline(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("no resources"));
    assert!(dir.path().join("offline.db").exists());
}

#[test]
fn test_download_inline_text_then_status_and_delete() {
    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(
        dir.path(),
        r#"{ "resources": [{
            "resource_id": "book-1",
            "units": [
                { "unit_id": "1", "text": { "inline": "<p>one</p>" } },
                { "unit_id": "2", "text": { "inline": "<p>two</p>" } }
            ]
        }] }"#,
    );

    offline(dir.path())
        .args(["-q", "download", "--no-progress", "-m"])
        .arg(&manifest)
        .assert()
        .success();

    offline(dir.path())
        .args(["status", "book-1", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"completed\""))
        .stdout(predicate::str::contains("\"completed_units\": 2"));

    offline(dir.path())
        .args(["summary", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"persistent_bytes\": 20"));

    offline(dir.path())
        .args(["delete", "book-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 file(s)"));

    offline(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("no resources"));
}

#[test]
fn test_download_unknown_resource_fails() {
    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(dir.path(), r#"{ "resources": [] }"#);
    offline(dir.path())
        .args(["download", "--no-progress", "--resource", "missing", "-m"])
        .arg(&manifest)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not in the manifest"));
}

#[test]
fn test_status_unknown_resource_fails() {
    let dir = TempDir::new().unwrap();
    offline(dir.path())
        .args(["status", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown resource"));
}

#[test]
fn test_invalid_config_value_fails() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "max_concurrent_transfers = 0\n").unwrap();
    offline(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_concurrent_transfers"));
}

#[tokio::test]
async fn test_download_with_failing_unit_exits_non_zero() {
    let Some(mock_server) = start_mock_server_or_skip().await else {
        return socket_skip_return();
    };
    Mock::given(method("GET"))
        .and(path("/ok.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3audio".to_vec()))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/gone.mp3"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(
        dir.path(),
        &format!(
            r#"{{ "resources": [{{
                "resource_id": "book-2",
                "units": [
                    {{ "unit_id": "1", "audio": {{ "url": "{base}/ok.mp3" }} }},
                    {{ "unit_id": "2", "audio": {{ "url": "{base}/gone.mp3" }} }}
                ]
            }}] }}"#,
            base = mock_server.uri()
        ),
    );
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "max_retries = 0\n").unwrap();

    let data_dir = dir.path().to_path_buf();
    let status = tokio::task::spawn_blocking(move || {
        let assert = offline(&data_dir)
            .arg("--config")
            .arg(&config)
            .args(["download", "--no-progress", "-m"])
            .arg(&manifest)
            .assert()
            .failure();
        let code = assert.get_output().status.code();

        let status = offline(&data_dir)
            .args(["status", "book-2"])
            .assert()
            .success();
        (code, String::from_utf8_lossy(&status.get_output().stdout).into_owned())
    })
    .await
    .unwrap();

    assert_eq!(status.0, Some(1));
    assert!(status.1.contains("book-2 failed 1/2 units"), "{}", status.1);
    assert!(status.1.contains("chapter_audio"), "{}", status.1);
}
