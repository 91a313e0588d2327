//! Metrics for the scraping fabric
//!
//! Counters are plain atomics; maps keyed by failure reason sit behind
//! DashMap shards. Latency percentiles come from a fixed 4096-slot
//! reservoir sampler, so memory stays bounded regardless of batch size.
//! Snapshots are immutable once built; readers never block writers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;

use crate::error::FailReason;
use crate::models::ScrapeResult;

/// Fixed-size reservoir (algorithm R) for latency sampling.
#[derive(Debug)]
pub struct ReservoirSampler {
    samples: Vec<u64>,
    capacity: usize,
    seen: u64,
    min: u64,
    max: u64,
    sum: u64,
}

impl ReservoirSampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            capacity,
            seen: 0,
            min: u64::MAX,
            max: 0,
            sum: 0,
        }
    }

    pub fn record(&mut self, value: u64) {
        self.seen += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        if self.samples.len() < self.capacity {
            self.samples.push(value);
        } else {
            let idx = rand::thread_rng().gen_range(0..self.seen);
            if (idx as usize) < self.capacity {
                self.samples[idx as usize] = value;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.seen == 0
    }

    /// Percentile over the current sample, nearest-rank.
    pub fn percentile(&self, p: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }

    pub fn stats(&self) -> LatencyStats {
        if self.is_empty() {
            return LatencyStats::default();
        }
        LatencyStats {
            avg: self.sum / self.seen,
            min: self.min,
            max: self.max,
            p50: self.percentile(50.0),
            p60: self.percentile(60.0),
            p70: self.percentile(70.0),
            p80: self.percentile(80.0),
            p90: self.percentile(90.0),
            p95: self.percentile(95.0),
            p99: self.percentile(99.0),
        }
    }
}

/// Processing-time summary published in the status object.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyStats {
    pub avg: u64,
    pub min: u64,
    pub max: u64,
    pub p50: u64,
    pub p60: u64,
    pub p70: u64,
    pub p80: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
}

/// Subpage-pipeline section of the status object.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubpagePipelineSnapshot {
    pub links_in_html_total: u64,
    pub links_after_filter: u64,
    pub links_selected: u64,
    pub links_per_company_avg: f64,
    pub selected_per_company_avg: f64,
    pub zero_links_companies: u64,
    pub zero_links_pct: f64,
    pub main_page_failures: u64,
    pub main_page_fail_reasons: HashMap<String, u64>,
    pub subpages_attempted: u64,
    pub subpages_ok: u64,
    pub subpages_failed: u64,
    pub subpage_success_rate_pct: f64,
    pub subpage_error_breakdown: HashMap<String, u64>,
}

/// Thread-safe metrics shared by every worker in a batch.
#[derive(Debug)]
pub struct ScrapeMetrics {
    started_at: Instant,

    pub processed: AtomicU64,
    pub success_count: AtomicU64,
    pub error_count: AtomicU64,
    pub in_progress: AtomicU64,
    pub peak_in_progress: AtomicU64,
    pub total_retries: AtomicU64,
    pub pages_total: AtomicU64,

    links_in_html_total: AtomicU64,
    links_after_filter: AtomicU64,
    links_selected: AtomicU64,
    zero_links_companies: AtomicU64,
    main_page_failures: AtomicU64,
    subpages_attempted: AtomicU64,
    subpages_ok: AtomicU64,
    subpages_failed: AtomicU64,

    error_breakdown: DashMap<FailReason, u64>,
    main_page_fail_reasons: DashMap<FailReason, u64>,
    subpage_error_breakdown: DashMap<FailReason, u64>,

    durations: Mutex<ReservoirSampler>,
    completions: Mutex<VecDeque<Instant>>,
}

impl ScrapeMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            processed: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            in_progress: AtomicU64::new(0),
            peak_in_progress: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            pages_total: AtomicU64::new(0),
            links_in_html_total: AtomicU64::new(0),
            links_after_filter: AtomicU64::new(0),
            links_selected: AtomicU64::new(0),
            zero_links_companies: AtomicU64::new(0),
            main_page_failures: AtomicU64::new(0),
            subpages_attempted: AtomicU64::new(0),
            subpages_ok: AtomicU64::new(0),
            subpages_failed: AtomicU64::new(0),
            error_breakdown: DashMap::new(),
            main_page_fail_reasons: DashMap::new(),
            subpage_error_breakdown: DashMap::new(),
            durations: Mutex::new(ReservoirSampler::new(4096)),
            completions: Mutex::new(VecDeque::new()),
        }
    }

    pub fn task_started(&self) {
        let current = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_progress.fetch_max(current, Ordering::SeqCst);
    }

    pub fn task_finished(&self) {
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
    }

    /// Fold one finished company into the counters.
    pub fn record_company(&self, result: &ScrapeResult) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_retries.fetch_add(result.retries as u64, Ordering::Relaxed);
        self.pages_total.fetch_add(result.pages.len() as u64, Ordering::Relaxed);

        self.links_in_html_total.fetch_add(result.links_seen, Ordering::Relaxed);
        self.links_after_filter.fetch_add(result.links_filtered, Ordering::Relaxed);
        self.links_selected.fetch_add(result.links_selected, Ordering::Relaxed);
        if result.links_seen == 0 {
            self.zero_links_companies.fetch_add(1, Ordering::Relaxed);
        }

        let stats = &result.subpage_stats;
        self.subpages_attempted.fetch_add(stats.attempted, Ordering::Relaxed);
        self.subpages_ok.fetch_add(stats.ok, Ordering::Relaxed);
        self.subpages_failed.fetch_add(stats.failed, Ordering::Relaxed);
        for (reason, count) in &stats.reason_histogram {
            *self.subpage_error_breakdown.entry(*reason).or_insert(0) += count;
        }

        if let Some(reason) = result.main_page_fail_reason {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            self.main_page_failures.fetch_add(1, Ordering::Relaxed);
            *self.error_breakdown.entry(reason).or_insert(0) += 1;
            *self.main_page_fail_reasons.entry(reason).or_insert(0) += 1;
        } else {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut durations = self.durations.lock().unwrap();
            durations.record(result.elapsed_ms);
        }
        {
            let mut completions = self.completions.lock().unwrap();
            let now = Instant::now();
            completions.push_back(now);
            while let Some(front) = completions.front() {
                if now.duration_since(*front).as_secs() >= 60 {
                    completions.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Companies completed in the sliding 60 s window, per minute.
    pub fn throughput_per_min(&self) -> f64 {
        let completions = self.completions.lock().unwrap();
        let now = Instant::now();
        completions
            .iter()
            .filter(|t| now.duration_since(**t).as_secs() < 60)
            .count() as f64
    }

    pub fn latency_stats(&self) -> LatencyStats {
        self.durations.lock().unwrap().stats()
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn error_breakdown_map(&self) -> HashMap<String, u64> {
        self.error_breakdown
            .iter()
            .map(|e| (e.key().as_str().to_string(), *e.value()))
            .collect()
    }

    pub fn subpage_pipeline_snapshot(&self) -> SubpagePipelineSnapshot {
        let processed = self.processed.load(Ordering::Relaxed).max(1);
        let attempted = self.subpages_attempted.load(Ordering::Relaxed);
        let ok = self.subpages_ok.load(Ordering::Relaxed);
        let zero = self.zero_links_companies.load(Ordering::Relaxed);

        SubpagePipelineSnapshot {
            links_in_html_total: self.links_in_html_total.load(Ordering::Relaxed),
            links_after_filter: self.links_after_filter.load(Ordering::Relaxed),
            links_selected: self.links_selected.load(Ordering::Relaxed),
            links_per_company_avg: self.links_in_html_total.load(Ordering::Relaxed) as f64
                / processed as f64,
            selected_per_company_avg: self.links_selected.load(Ordering::Relaxed) as f64
                / processed as f64,
            zero_links_companies: zero,
            zero_links_pct: 100.0 * zero as f64 / processed as f64,
            main_page_failures: self.main_page_failures.load(Ordering::Relaxed),
            main_page_fail_reasons: self
                .main_page_fail_reasons
                .iter()
                .map(|e| (e.key().as_str().to_string(), *e.value()))
                .collect(),
            subpages_attempted: attempted,
            subpages_ok: ok,
            subpages_failed: self.subpages_failed.load(Ordering::Relaxed),
            subpage_success_rate_pct: if attempted > 0 {
                100.0 * ok as f64 / attempted as f64
            } else {
                0.0
            },
            subpage_error_breakdown: self
                .subpage_error_breakdown
                .iter()
                .map(|e| (e.key().as_str().to_string(), *e.value()))
                .collect(),
        }
    }
}

impl Default for ScrapeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ScrapedPage, SubpageStats};

    fn ok_result(elapsed_ms: u64) -> ScrapeResult {
        ScrapeResult {
            pages: vec![ScrapedPage {
                url: "https://acme.com.br".into(),
                text: "x".into(),
                bytes: 1,
            }],
            main_page_fail_reason: None,
            subpage_stats: SubpageStats::default(),
            links_seen: 10,
            links_filtered: 8,
            links_selected: 5,
            retries: 1,
            elapsed_ms,
        }
    }

    #[test]
    fn test_reservoir_percentiles() {
        let mut sampler = ReservoirSampler::new(4096);
        for v in 1..=100 {
            sampler.record(v);
        }
        assert_eq!(sampler.percentile(50.0), 50);
        assert_eq!(sampler.percentile(95.0), 95);
        assert_eq!(sampler.percentile(99.0), 99);
        let stats = sampler.stats();
        assert_eq!(stats.min, 1);
        assert_eq!(stats.max, 100);
    }

    #[test]
    fn test_reservoir_bounded_memory() {
        let mut sampler = ReservoirSampler::new(16);
        for v in 0..10_000 {
            sampler.record(v);
        }
        assert_eq!(sampler.samples.len(), 16);
        assert_eq!(sampler.seen, 10_000);
        // min/max survive eviction
        assert_eq!(sampler.stats().min, 0);
        assert_eq!(sampler.stats().max, 9_999);
    }

    #[test]
    fn test_record_company_success() {
        let metrics = ScrapeMetrics::new();
        metrics.record_company(&ok_result(1500));

        assert_eq!(metrics.processed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.success_count.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.error_count.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.total_retries.load(Ordering::Relaxed), 1);

        let pipeline = metrics.subpage_pipeline_snapshot();
        assert_eq!(pipeline.links_in_html_total, 10);
        assert_eq!(pipeline.links_after_filter, 8);
        assert_eq!(pipeline.links_selected, 5);
    }

    #[test]
    fn test_record_company_failure_breakdown() {
        let metrics = ScrapeMetrics::new();
        metrics.record_company(&ScrapeResult::failed(FailReason::ProbeTimeout, 5000));
        metrics.record_company(&ScrapeResult::failed(FailReason::ProbeTimeout, 4000));

        assert_eq!(metrics.error_count.load(Ordering::Relaxed), 2);
        let breakdown = metrics.error_breakdown_map();
        assert_eq!(breakdown["probe:timeout"], 2);
        let pipeline = metrics.subpage_pipeline_snapshot();
        assert_eq!(pipeline.main_page_failures, 2);
        assert_eq!(pipeline.main_page_fail_reasons["probe:timeout"], 2);
    }

    #[test]
    fn test_peak_in_progress() {
        let metrics = ScrapeMetrics::new();
        metrics.task_started();
        metrics.task_started();
        metrics.task_finished();
        metrics.task_started();
        assert_eq!(metrics.in_progress.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.peak_in_progress.load(Ordering::SeqCst), 2);
    }
}
