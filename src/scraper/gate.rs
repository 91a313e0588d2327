//! Two-tier concurrency gate
//!
//! A global semaphore caps in-flight requests for the whole process; a
//! lazily-created per-host semaphore caps each registrable domain. Both
//! acquisitions share one deadline. The global semaphore is the
//! back-pressure primitive: when it is saturated, new batch entries
//! wait here and nothing queues unbounded deeper in the fabric.
//!
//! Within one host, acquires are served in arrival order (tokio
//! semaphores are FIFO); across hosts no ordering is guaranteed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::GateConfig;
use crate::error::FailReason;

/// Latency window per host for the moving-p95 slow check.
const LATENCY_WINDOW: usize = 32;

/// Holds one global slot and one per-host slot. Dropping the lease
/// releases both; release is idempotent and happens on every exit path
/// including panic.
#[derive(Debug)]
pub struct Lease {
    _global: OwnedSemaphorePermit,
    _domain: OwnedSemaphorePermit,
    gate: Arc<GateCounters>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct GateCounters {
    active: AtomicU64,
    total: AtomicU64,
    peak: AtomicU64,
    timeouts: AtomicU64,
}

/// Gate status for the `infrastructure` section.
#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub active_requests: u64,
    pub total_requests: u64,
    pub peak_concurrent: u64,
    pub acquire_timeouts: u64,
    pub global_limit: usize,
    pub per_domain_limit: usize,
    pub slow_domains: usize,
    pub tracked_domains: usize,
}

/// The concurrency gate.
#[derive(Debug)]
pub struct ConcurrencyGate {
    global: Arc<Semaphore>,
    domains: DashMap<String, Arc<Semaphore>>,
    slow: DashSet<String>,
    latencies: DashMap<String, VecDeque<u64>>,
    counters: Arc<GateCounters>,
    cfg: GateConfig,
}

impl ConcurrencyGate {
    pub fn new(cfg: GateConfig) -> Self {
        Self {
            global: Arc::new(Semaphore::new(cfg.global_concurrency)),
            domains: DashMap::new(),
            slow: DashSet::new(),
            latencies: DashMap::new(),
            counters: Arc::new(GateCounters::default()),
            cfg,
        }
    }

    fn domain_semaphore(&self, host: &str) -> Arc<Semaphore> {
        self.domains
            .entry(host.to_string())
            .or_insert_with(|| {
                let limit = if self.slow.contains(host) {
                    self.cfg.slow_domain_limit
                } else {
                    self.cfg.per_domain_limit
                };
                Arc::new(Semaphore::new(limit))
            })
            .clone()
    }

    /// Acquire the global slot, then the per-host slot, within one
    /// shared deadline. Timing out on either returns
    /// `infra:concurrency_timeout` and releases anything held.
    pub async fn acquire(&self, host: &str, deadline: Instant) -> Result<Lease, FailReason> {
        let global = match tokio::time::timeout_at(deadline, self.global.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(FailReason::ConcurrencyTimeout),
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(host, "Gate timeout waiting for global slot");
                return Err(FailReason::ConcurrencyTimeout);
            }
        };

        let sem = self.domain_semaphore(host);
        let domain = match tokio::time::timeout_at(deadline, sem.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(FailReason::ConcurrencyTimeout),
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(host, "Gate timeout waiting for domain slot");
                return Err(FailReason::ConcurrencyTimeout);
            }
        };

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        Ok(Lease {
            _global: global,
            _domain: domain,
            gate: self.counters.clone(),
        })
    }

    /// Record a fetch latency for the host. When the moving p95 over
    /// the window exceeds the threshold, the host is flagged slow and
    /// future acquires see the reduced cap.
    pub fn record_latency(&self, host: &str, elapsed_ms: u64) {
        let mut window = self
            .latencies
            .entry(host.to_string())
            .or_insert_with(|| VecDeque::with_capacity(LATENCY_WINDOW));
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed_ms);

        if window.len() >= 8 && !self.slow.contains(host) {
            let mut sorted: Vec<u64> = window.iter().copied().collect();
            sorted.sort_unstable();
            let rank = ((0.95 * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
            let p95 = sorted[rank - 1];
            if p95 > self.cfg.slow_threshold_ms {
                drop(window);
                self.mark_slow(host);
            }
        }
    }

    /// Flag a host as slow: new acquires go through a semaphore with
    /// the reduced cap. Permits already held drain against the old one.
    pub fn mark_slow(&self, host: &str) {
        if self.slow.insert(host.to_string()) {
            self.domains.insert(
                host.to_string(),
                Arc::new(Semaphore::new(self.cfg.slow_domain_limit)),
            );
            info!(host, limit = self.cfg.slow_domain_limit, "Domain flagged slow");
        }
    }

    pub fn is_slow(&self, host: &str) -> bool {
        self.slow.contains(host)
    }

    pub fn status(&self) -> GateStatus {
        GateStatus {
            active_requests: self.counters.active.load(Ordering::SeqCst),
            total_requests: self.counters.total.load(Ordering::Relaxed),
            peak_concurrent: self.counters.peak.load(Ordering::SeqCst),
            acquire_timeouts: self.counters.timeouts.load(Ordering::Relaxed),
            global_limit: self.cfg.global_concurrency,
            per_domain_limit: self.cfg.per_domain_limit,
            slow_domains: self.slow.len(),
            tracked_domains: self.domains.len(),
        }
    }
}
