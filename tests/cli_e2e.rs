//! End-to-end CLI tests for the harvester binary.

mod support;

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::MockServer;

use support::{catalog_page, serve_page};

/// Writes a config that keeps every data file inside `dir`.
fn write_config(dir: &Path, base_url: &str) -> std::path::PathBuf {
    let config = serde_json::json!({
        "base_url": base_url,
        "proxy_enabled": false,
        "download_dir": dir.join("music"),
        "entities_file": dir.join("singers.json"),
        "items_file": dir.join("songs.json"),
        "crawl_cache_file": dir.join("crawl_cache.json"),
        "download_index_file": dir.join("downloaded_cache.json"),
        "proxy": {
            "manual_list": dir.join("proxies.txt"),
            "cache_file": dir.join("proxy_cache.json"),
            "api_sources": []
        }
    });
    let path = dir.join("config.json");
    std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
    path
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    let mut cmd = Command::cargo_bin("harvester").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Crawl a music catalog"));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    let mut cmd = Command::cargo_bin("harvester").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("harvester"));
}

/// Test that invalid flags cause non-zero exit.
#[test]
fn test_binary_invalid_flag_returns_error() {
    let mut cmd = Command::cargo_bin("harvester").unwrap();
    cmd.arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

/// Test that running without a subcommand prints usage and fails.
#[test]
fn test_binary_requires_subcommand() {
    let mut cmd = Command::cargo_bin("harvester").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

/// Test that stats on an empty workspace reports zero items.
#[test]
fn test_stats_on_empty_store() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "https://music.example.com");

    let mut cmd = Command::cargo_bin("harvester").unwrap();
    cmd.arg("stats")
        .arg("--config")
        .arg(&config)
        .arg("-q")
        .assert()
        .success()
        .stdout(predicate::str::contains("total_items: 0"))
        .stdout(predicate::str::contains("total_entities: 0"));
}

/// Test that an out-of-range config value is rejected before any work.
#[test]
fn test_invalid_config_value_fails() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.json");
    std::fs::write(&config, r#"{"max_workers_ceiling": 0}"#).unwrap();

    let mut cmd = Command::cargo_bin("harvester").unwrap();
    cmd.args(["stats", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_workers_ceiling"));
}

/// Test that malformed JSON config is reported with its path.
#[test]
fn test_malformed_config_fails() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.json");
    std::fs::write(&config, "{ not json").unwrap();

    let mut cmd = Command::cargo_bin("harvester").unwrap();
    cmd.args(["stats", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("loading config"));
}

/// Test that items without a prior entity crawl explains what to do.
#[test]
fn test_items_without_entities_prints_hint() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "https://music.example.com");

    let mut cmd = Command::cargo_bin("harvester").unwrap();
    cmd.args(["items", "-q", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("no entities to crawl"));
}

/// Test that the entities command crawls a mock catalog and persists matches.
#[tokio::test(flavor = "multi_thread")]
async fn test_entities_command_persists_matches() {
    let server = MockServer::start().await;
    serve_page(
        &server,
        "/singers/index/index/1.html",
        catalog_page(&[("1", "Jay Chou"), ("2", "Faye Wong")], Some(1)),
    )
    .await;
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &server.uri());

    let mut cmd = Command::cargo_bin("harvester").unwrap();
    cmd.args(["entities", "-k", "jay", "-q", "--no-proxy", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("entities: 1 from 1 pages"))
        .stdout(predicate::str::contains("1 Jay Chou"));

    let stored = std::fs::read_to_string(dir.path().join("singers.json")).unwrap();
    assert!(stored.contains("Jay Chou"));
    assert!(!stored.contains("Faye Wong"));
}
