//! End-to-end resume behavior against a mock search API.
//!
//! The first run fetches pages 1 and 2, then page 3 is rate limited three
//! times and finally times out, exhausting the retries. The second run must
//! request page 3 only and produce the complete output.

mod common;

use common::fixtures::{read_json, test_config};
use common::wiremock_helpers::*;
use harvester::completion::RescanPolicy;
use harvester::fetcher::RateLimitedFetcher;
use harvester::logger::{HarvestLogger, RunLog, VerbosityLevel};
use harvester::util::today_stamp;
use harvester::{CheckpointStore, HarvestConfig, HarvestEngine};
use serde_json::json;
use std::fs;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::MockServer;

const KEY: &str = "192.0.2.1";

fn engine(config: &HarvestConfig) -> HarvestEngine<RateLimitedFetcher> {
    // Client timeout well below the slow mock's delay
    let fetcher = RateLimitedFetcher::build(Duration::from_millis(200), "harvester-test", &config.retry)
        .expect("client builds");
    let run_log = RunLog::open(&config.output.log_dir.join("run.csv")).unwrap();

    HarvestEngine::new(
        config,
        fetcher,
        Some("test-key"),
        HarvestLogger::new(VerbosityLevel::Silent),
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap()
    .with_run_log(run_log)
}

fn record(n: u32) -> serde_json::Value {
    json!({ "ip": KEY, "port": n })
}

#[tokio::test]
async fn test_rate_limit_then_timeout_resumes_at_missing_page() {
    let tmp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let mut config = test_config(tmp.path(), &search_url(&server));
    config.retry.max_retries = 3;

    mount_page(&server, 1, page_body(3, vec![record(1), record(2)]), 1).await;
    mount_page(&server, 2, page_body(3, vec![record(3), record(4)]), 1).await;
    mount_rate_limited(&server, 3, 3).await;
    mount_slow_page(&server, 3, Duration::from_secs(2)).await;

    let summary = engine(&config).run(&[KEY.to_string()], RescanPolicy::SkipCompleted).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.ok, 0);
    assert_eq!(summary.failed_keys, vec![KEY.to_string()]);

    // 1 + 1 + 3 rate limited + 1 timed out
    assert_eq!(request_count(&server).await, 6);
    server.verify().await;

    let store = CheckpointStore::new(config.output.checkpoint_dir());
    let checkpoint = store.load(KEY, "ip = \"192.0.2.1\"").unwrap().expect("checkpoint kept");
    assert_eq!(checkpoint.pages_done.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(checkpoint.total_pages, Some(3));
    assert_eq!(checkpoint.results_count(), 4);

    let marker = config
        .output
        .output_dir
        .join(format!("harvest_{}_{}.json", KEY, today_stamp()));
    assert!(!marker.exists(), "no completion marker for a partial unit");

    // Second run: only page 3 may be requested
    server.reset().await;
    mount_page(&server, 1, page_body(3, vec![]), 0).await;
    mount_page(&server, 2, page_body(3, vec![]), 0).await;
    mount_page(&server, 3, page_body(3, vec![record(5)]), 1).await;

    let summary = engine(&config).run(&[KEY.to_string()], RescanPolicy::SkipCompleted).await.unwrap();
    assert_eq!(summary.ok, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(request_count(&server).await, 1);
    server.verify().await;

    let doc = read_json(&marker);
    assert_eq!(doc["key"], KEY);
    assert_eq!(doc["total_pages"], 3);
    assert_eq!(doc["results_count"], 5);
    let ports: Vec<u64> = doc["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["port"].as_u64().unwrap())
        .collect();
    assert_eq!(ports, vec![1, 2, 3, 4, 5]);

    assert!(store.list().unwrap().is_empty(), "checkpoint removed after completion");

    let log = fs::read_to_string(config.output.log_dir.join("run.csv")).unwrap();
    let statuses: Vec<&str> = log.lines().skip(1).map(|l| l.split(',').nth(1).unwrap()).collect();
    assert_eq!(statuses, vec!["FAIL", "OK"]);
}

#[tokio::test]
async fn test_completed_keys_are_never_refetched() {
    let tmp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = test_config(tmp.path(), &search_url(&server));

    mount_query_page(&server, "ip = \"10.0.0.1\"", 1, page_body(1, vec![json!({"ip": "10.0.0.1"})])).await;
    mount_query_page(&server, "ip = \"10.0.0.2\"", 1, page_body(1, vec![json!({"ip": "10.0.0.2"})])).await;

    let keys = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
    let first = engine(&config).run(&keys, RescanPolicy::SkipCompleted).await.unwrap();
    assert_eq!(first.ok, 2);
    assert_eq!(request_count(&server).await, 2);

    let second = engine(&config).run(&keys, RescanPolicy::SkipCompleted).await.unwrap();
    assert_eq!(second.skipped, 2);
    assert_eq!(second.ok, 0);
    assert_eq!(request_count(&server).await, 2, "no requests for completed keys");

    let log = fs::read_to_string(config.output.log_dir.join("run.csv")).unwrap();
    assert_eq!(log.matches("SKIP_EXISTS").count(), 2);
    assert_eq!(log.matches("key,status,result_count,timestamp_utc").count(), 1);
}

#[tokio::test]
async fn test_rescan_all_fetches_completed_keys_again() {
    let tmp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let config = test_config(tmp.path(), &search_url(&server));

    mount_page(&server, 1, page_body(1, vec![json!({"ip": "10.0.0.9"})]), 2).await;

    let keys = vec!["10.0.0.9".to_string()];
    engine(&config).run(&keys, RescanPolicy::SkipCompleted).await.unwrap();
    let again = engine(&config).run(&keys, RescanPolicy::RescanAll).await.unwrap();

    assert_eq!(again.ok, 1);
    assert_eq!(again.skipped, 0);
    server.verify().await;
}

#[tokio::test]
async fn test_http_error_fails_unit_without_retry() {
    let tmp = TempDir::new().unwrap();
    let server = MockServer::start().await;
    let mut config = test_config(tmp.path(), &search_url(&server));
    config.retry.max_retries = 5;

    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .respond_with(wiremock::ResponseTemplate::new(400).set_body_string("bad query"))
        .expect(1)
        .mount(&server)
        .await;

    let summary = engine(&config).run(&["bad".to_string()], RescanPolicy::SkipCompleted).await.unwrap();
    assert_eq!(summary.failed, 1);
    server.verify().await;
}
