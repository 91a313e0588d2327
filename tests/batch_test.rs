//! Batch processor and status-object tests.

mod common;

use std::sync::Arc;

use common::{mount_site, test_config, MemorySink};
use garimpo::models::CompanyInput;
use garimpo::scraper::batch::{BatchProcessor, NoCandidates};
use garimpo::scraper::ScrapeContext;
use wiremock::MockServer;

fn company(id: &str, url: Option<String>) -> CompanyInput {
    CompanyInput {
        registration_id: id.to_string(),
        url,
        trade_name: None,
        city: None,
    }
}

#[tokio::test]
async fn test_batch_mixed_outcomes() {
    let server = MockServer::start().await;
    mount_site(&server).await;

    let mut config = test_config();
    config.scrape.workers = 4;
    let ctx = ScrapeContext::new(config);
    let sink = Arc::new(MemorySink::default());
    let batch = BatchProcessor::new(ctx, sink.clone(), Arc::new(NoCandidates));

    let companies = vec![
        company("11111111", Some(server.uri())),
        company("22222222", Some("http://127.0.0.1:1".to_string())),
    ];
    let snapshot = batch.run(companies).await;

    assert_eq!(snapshot.status, "completed");
    assert_eq!(snapshot.total, 2);
    assert_eq!(snapshot.processed, 2);
    assert_eq!(snapshot.success_count, 1);
    assert_eq!(snapshot.error_count, 1);
    assert_eq!(snapshot.remaining, 0);
    assert!((snapshot.success_rate_pct - 50.0).abs() < 1e-9);
    assert_eq!(snapshot.error_breakdown["probe:unknown"], 1);
    assert_eq!(snapshot.instances.len(), 1);
    assert_eq!(snapshot.instances[0].processed, 2);

    // The dead host shows up in the last-errors ring
    assert!(snapshot
        .last_errors
        .iter()
        .any(|e| e.id == "22222222" && e.error.contains("probe:unknown")));

    // Only the successful company reached the sink
    let saved = sink.saved_pages.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0, "11111111");
    assert_eq!(saved[0].1.len(), 6);
}

#[tokio::test]
async fn test_company_without_url_and_no_candidates_fails() {
    let mut config = test_config();
    config.scrape.workers = 1;
    let ctx = ScrapeContext::new(config);
    let sink = Arc::new(MemorySink::default());
    let batch = BatchProcessor::new(ctx, sink.clone(), Arc::new(NoCandidates));

    let snapshot = batch.run(vec![company("33333333", None)]).await;

    assert_eq!(snapshot.error_count, 1);
    assert_eq!(snapshot.success_count, 0);
    assert!(sink.saved_pages.lock().unwrap().is_empty());
}

/// The status object keeps its stable wire shape.
#[tokio::test]
async fn test_status_object_shape() {
    let server = MockServer::start().await;
    mount_site(&server).await;

    let mut config = test_config();
    config.scrape.workers = 1;
    let ctx = ScrapeContext::new(config);
    let batch = BatchProcessor::new(ctx, Arc::new(MemorySink::default()), Arc::new(NoCandidates));

    let snapshot = batch.run(vec![company("44444444", Some(server.uri()))]).await;
    let json = serde_json::to_value(&snapshot).unwrap();

    for key in [
        "batch_id",
        "status",
        "total",
        "processed",
        "success_count",
        "error_count",
        "success_rate_pct",
        "remaining",
        "in_progress",
        "peak_in_progress",
        "throughput_per_min",
        "elapsed_seconds",
        "processing_time_ms",
        "error_breakdown",
        "pages_per_company_avg",
        "total_retries",
        "subpage_pipeline",
        "infrastructure",
        "last_errors",
        "instances",
    ] {
        assert!(json.get(key).is_some(), "missing status key: {key}");
    }

    let timing = &json["processing_time_ms"];
    for key in ["avg", "min", "max", "p50", "p60", "p70", "p80", "p90", "p95", "p99"] {
        assert!(timing.get(key).is_some(), "missing timing key: {key}");
    }

    let pipeline = &json["subpage_pipeline"];
    for key in [
        "links_in_html_total",
        "links_after_filter",
        "links_selected",
        "links_per_company_avg",
        "selected_per_company_avg",
        "zero_links_companies",
        "zero_links_pct",
        "main_page_failures",
        "main_page_fail_reasons",
        "subpages_attempted",
        "subpages_ok",
        "subpages_failed",
        "subpage_success_rate_pct",
        "subpage_error_breakdown",
    ] {
        assert!(pipeline.get(key).is_some(), "missing pipeline key: {key}");
    }

    let infra = &json["infrastructure"];
    for key in ["proxy_pool", "concurrency", "rate_limiter", "circuit_breaker"] {
        assert!(infra.get(key).is_some(), "missing infrastructure key: {key}");
    }

    assert_eq!(json["subpage_pipeline"]["subpages_ok"], 5);
    assert_eq!(json["subpage_pipeline"]["subpage_success_rate_pct"], 100.0);
}

/// Final status is persisted through the sink.
#[tokio::test]
async fn test_final_status_saved() {
    let server = MockServer::start().await;
    mount_site(&server).await;

    let mut config = test_config();
    config.scrape.workers = 1;
    let ctx = ScrapeContext::new(config);
    let sink = Arc::new(MemorySink::default());
    let batch = BatchProcessor::new(ctx, sink.clone(), Arc::new(NoCandidates));

    batch.run(vec![company("55555555", Some(server.uri()))]).await;

    let statuses = sink.saved_statuses.lock().unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, "completed");
    assert_eq!(statuses[0].processed, 1);
}
