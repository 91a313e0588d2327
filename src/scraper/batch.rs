//! Batch processing: worker pool, external interfaces, status object
//!
//! A batch takes a list of company inputs, resolves missing URLs
//! through the search-engine client, drives one orchestrator task per
//! company over a bounded worker pool, and hands finished pages to the
//! persistence sink. The global concurrency gate provides all the
//! back-pressure; the queue here only decouples the producer from the
//! workers.
//!
//! The status object exposed by [`BatchProcessor::status`] has a stable
//! shape consumed by the batch-status endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::FailReason;
use crate::metrics::{LatencyStats, SubpagePipelineSnapshot};
use crate::models::{CompanyInput, ScrapeResult, ScrapedPage, SubpageStats};
use crate::scraper::{orchestrator, InfrastructureStatus, ScrapeContext};

/// Workers started per ramp-up step, with a short pause between steps
/// so a cold proxy pool is not hit by everything at once.
const RAMP_STEP: usize = 100;
const RAMP_PAUSE: Duration = Duration::from_millis(500);

/// Entries kept in the last-errors ring.
const LAST_ERRORS_KEPT: usize = 10;

/// Batch-level retries for companies that failed with a transient
/// reason.
const BATCH_MAX_RETRIES: u32 = 1;

/// Search-engine client contract (out of scope; consumed here).
pub trait CandidateFinder: Send + Sync {
    /// At most 25 candidate URLs, best-effort ranked.
    fn find_candidates<'a>(
        &'a self,
        trade_name: Option<&'a str>,
        city: Option<&'a str>,
        registration_id: &'a str,
    ) -> BoxFuture<'a, Vec<String>>;
}

/// Persistence sink contract (out of scope; fed from here).
pub trait PageSink: Send + Sync {
    fn save_pages<'a>(
        &'a self,
        batch_id: &'a str,
        company_id: &'a str,
        pages: &'a [ScrapedPage],
        stats: &'a SubpageStats,
    ) -> BoxFuture<'a, ()>;

    fn save_status<'a>(&'a self, batch_id: &'a str, snapshot: &'a StatusSnapshot)
        -> BoxFuture<'a, ()>;
}

/// Finder that never finds anything; companies without a URL fail with
/// `probe:unknown`.
pub struct NoCandidates;

impl CandidateFinder for NoCandidates {
    fn find_candidates<'a>(
        &'a self,
        _trade_name: Option<&'a str>,
        _city: Option<&'a str>,
        _registration_id: &'a str,
    ) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async { Vec::new() })
    }
}

/// Sink that drops everything; useful for dry runs and tests.
pub struct NullSink;

impl PageSink for NullSink {
    fn save_pages<'a>(
        &'a self,
        _batch_id: &'a str,
        _company_id: &'a str,
        _pages: &'a [ScrapedPage],
        _stats: &'a SubpageStats,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }

    fn save_status<'a>(
        &'a self,
        _batch_id: &'a str,
        _snapshot: &'a StatusSnapshot,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// One entry of the `last_errors` ring.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub id: String,
    pub url: String,
    pub error: String,
    pub time: DateTime<Utc>,
}

/// Per-instance entry of the status object. This process contributes
/// one instance; a fleet aggregates several.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: String,
    pub status: String,
    pub processed: u64,
    pub success: u64,
    pub errors: u64,
    pub throughput_per_min: f64,
}

/// The batch status object, stable shape.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub batch_id: String,
    pub status: String,
    pub total: u64,
    pub processed: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub success_rate_pct: f64,
    pub remaining: u64,
    pub in_progress: u64,
    pub peak_in_progress: u64,
    pub throughput_per_min: f64,
    pub elapsed_seconds: u64,
    pub processing_time_ms: LatencyStats,
    pub error_breakdown: std::collections::HashMap<String, u64>,
    pub pages_per_company_avg: f64,
    pub total_retries: u64,
    pub subpage_pipeline: SubpagePipelineSnapshot,
    pub infrastructure: InfrastructureStatus,
    pub last_errors: Vec<ErrorEntry>,
    pub instances: Vec<InstanceStatus>,
}

/// Batch processor: one per inbound batch request.
pub struct BatchProcessor {
    batch_id: String,
    ctx: Arc<ScrapeContext>,
    sink: Arc<dyn PageSink>,
    finder: Arc<dyn CandidateFinder>,
    total: AtomicU64,
    state: Mutex<String>,
    last_errors: Mutex<VecDeque<ErrorEntry>>,
}

impl BatchProcessor {
    pub fn new(
        ctx: Arc<ScrapeContext>,
        sink: Arc<dyn PageSink>,
        finder: Arc<dyn CandidateFinder>,
    ) -> Arc<Self> {
        let batch_id = format!("{:08x}", rand::random::<u32>());
        Arc::new(Self {
            batch_id,
            ctx,
            sink,
            finder,
            total: AtomicU64::new(0),
            state: Mutex::new(String::from("idle")),
            last_errors: Mutex::new(VecDeque::with_capacity(LAST_ERRORS_KEPT)),
        })
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Run the whole batch to completion. Workers ramp up in groups;
    /// the final status snapshot is persisted through the sink and
    /// returned.
    pub async fn run(self: Arc<Self>, companies: Vec<CompanyInput>) -> StatusSnapshot {
        self.total.store(companies.len() as u64, Ordering::SeqCst);
        *self.state.lock().unwrap() = String::from("running");

        let worker_count = self.ctx.config.scrape.workers.min(companies.len()).max(1);
        info!(
            batch_id = %self.batch_id,
            total = companies.len(),
            workers = worker_count,
            proxies = self.ctx.proxies.len(),
            "Batch starting"
        );

        let (tx, rx) = mpsc::channel::<CompanyInput>(worker_count * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let this = self.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let company = { rx.lock().await.recv().await };
                    let Some(company) = company else { break };
                    this.process_company(company).await;
                }
            }));
            if (i + 1) % RAMP_STEP == 0 && i + 1 < worker_count {
                info!(batch_id = %self.batch_id, started = i + 1, "Worker ramp-up");
                tokio::time::sleep(RAMP_PAUSE).await;
            }
        }

        for company in companies {
            if tx.send(company).await.is_err() {
                break;
            }
        }
        drop(tx);

        for worker in workers {
            if let Err(e) = worker.await {
                error!(batch_id = %self.batch_id, error = %e, "Worker task failed");
            }
        }

        *self.state.lock().unwrap() = String::from("completed");
        let snapshot = self.status();
        self.sink.save_status(&self.batch_id, &snapshot).await;
        info!(
            batch_id = %self.batch_id,
            success = snapshot.success_count,
            errors = snapshot.error_count,
            elapsed_s = snapshot.elapsed_seconds,
            "Batch completed"
        );
        snapshot
    }

    /// Resolve, scrape and record one company, with one batch-level
    /// retry for transient failure reasons.
    async fn process_company(&self, company: CompanyInput) {
        self.ctx.metrics.task_started();

        let url = match &company.url {
            Some(url) => Some(url.clone()),
            None => {
                let candidates = self
                    .finder
                    .find_candidates(
                        company.trade_name.as_deref(),
                        company.city.as_deref(),
                        &company.registration_id,
                    )
                    .await;
                candidates.into_iter().next()
            }
        };

        let result = match url {
            Some(url) => {
                let mut result = orchestrator::scrape_company(&self.ctx, &url).await;
                let mut attempt = 0;
                while let Some(reason) = result.main_page_fail_reason {
                    if attempt >= BATCH_MAX_RETRIES || !reason.is_transient() {
                        break;
                    }
                    attempt += 1;
                    let backoff = Duration::from_secs(2u64.pow(attempt));
                    warn!(
                        id = %company.registration_id,
                        %reason,
                        attempt,
                        "Transient failure, retrying company"
                    );
                    tokio::time::sleep(backoff).await;
                    let retry = orchestrator::scrape_company(&self.ctx, &url).await;
                    let carried = result.retries + retry.retries + 1;
                    result = retry;
                    result.retries = carried;
                }
                if let Some(reason) = result.main_page_fail_reason {
                    self.record_error(&company.registration_id, &url, reason.as_str());
                }
                result
            }
            None => {
                self.record_error(&company.registration_id, "", "no candidate url");
                ScrapeResult::failed(FailReason::ProbeUnknown, 0)
            }
        };

        self.ctx.metrics.record_company(&result);
        self.ctx.metrics.task_finished();

        if result.is_success() {
            self.sink
                .save_pages(
                    &self.batch_id,
                    &company.registration_id,
                    &result.pages,
                    &result.subpage_stats,
                )
                .await;
        }
    }

    fn record_error(&self, id: &str, url: &str, error: &str) {
        let mut ring = self.last_errors.lock().unwrap();
        if ring.len() == LAST_ERRORS_KEPT {
            ring.pop_front();
        }
        ring.push_back(ErrorEntry {
            id: id.to_string(),
            url: url.chars().take(80).collect(),
            error: error.chars().take(200).collect(),
            time: Utc::now(),
        });
    }

    /// Build the status object from live counters. The snapshot is a
    /// value: once built it never changes, and building it never blocks
    /// the workers.
    pub fn status(&self) -> StatusSnapshot {
        let metrics = &self.ctx.metrics;
        let total = self.total.load(Ordering::SeqCst);
        let processed = metrics.processed.load(Ordering::Relaxed);
        let success = metrics.success_count.load(Ordering::Relaxed);
        let errors = metrics.error_count.load(Ordering::Relaxed);
        let throughput = metrics.throughput_per_min();
        let state = self.state.lock().unwrap().clone();

        StatusSnapshot {
            batch_id: self.batch_id.clone(),
            status: state.clone(),
            total,
            processed,
            success_count: success,
            error_count: errors,
            success_rate_pct: if processed > 0 {
                100.0 * success as f64 / processed as f64
            } else {
                0.0
            },
            remaining: total.saturating_sub(processed),
            in_progress: metrics.in_progress.load(Ordering::SeqCst),
            peak_in_progress: metrics.peak_in_progress.load(Ordering::SeqCst),
            throughput_per_min: throughput,
            elapsed_seconds: metrics.elapsed_seconds(),
            processing_time_ms: metrics.latency_stats(),
            error_breakdown: metrics.error_breakdown_map(),
            pages_per_company_avg: if processed > 0 {
                metrics.pages_total.load(Ordering::Relaxed) as f64 / processed as f64
            } else {
                0.0
            },
            total_retries: metrics.total_retries.load(Ordering::Relaxed),
            subpage_pipeline: metrics.subpage_pipeline_snapshot(),
            infrastructure: self.ctx.infrastructure(),
            last_errors: self.last_errors.lock().unwrap().iter().cloned().collect(),
            instances: vec![InstanceStatus {
                id: self.batch_id.clone(),
                status: state,
                processed,
                success,
                errors,
                throughput_per_min: throughput,
            }],
        }
    }

    /// Spawn a background publisher that refreshes the sink's status
    /// view at the given cadence until the batch completes.
    pub fn spawn_status_publisher(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let snapshot = this.status();
                this.sink.save_status(&this.batch_id, &snapshot).await;
                if snapshot.status == "completed" {
                    break;
                }
            }
        })
    }
}
