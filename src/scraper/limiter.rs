//! Per-domain rate limiter
//!
//! Built on governor's keyed limiter with a DashMap state store: one
//! bucket per registrable domain, refilled lazily by the GCRA state on
//! each check, so idle domains cost nothing. Two tiers share the
//! fabric: hosts flagged slow route to a second limiter with the
//! reduced quota, the same way the gate swaps in its reduced-cap
//! semaphore. Waiting is bounded by the caller's deadline; an acquire
//! that would have to wait past it fails with
//! `infra:ratelimit_timeout` without sleeping.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DashMapStateStore;
use governor::{Quota, RateLimiter};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RateConfig;
use crate::error::FailReason;

type KeyedLimiter = RateLimiter<String, DashMapStateStore<String>, DefaultClock>;

/// Limiter status for the `infrastructure` section.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStatus {
    pub domains_tracked: usize,
    pub slow_domains: usize,
    pub total_acquired: u64,
    pub throttled: u64,
    pub throttle_timeouts: u64,
    pub default_rpm: u32,
    pub slow_rpm: u32,
    pub burst_size: u32,
}

/// The per-domain rate limiter.
pub struct DomainRateLimiter {
    default_tier: KeyedLimiter,
    slow_tier: KeyedLimiter,
    slow: DashSet<String>,
    clock: DefaultClock,
    total_acquired: AtomicU64,
    throttled: AtomicU64,
    timeouts: AtomicU64,
    cfg: RateConfig,
}

fn per_minute(rpm: u32, burst: u32) -> Quota {
    let rpm = NonZeroU32::new(rpm).unwrap_or(NonZeroU32::new(1).unwrap());
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::new(1).unwrap());
    Quota::per_minute(rpm).allow_burst(burst)
}

impl DomainRateLimiter {
    pub fn new(cfg: RateConfig) -> Self {
        Self {
            default_tier: RateLimiter::dashmap(per_minute(cfg.rpm_default, cfg.burst_size)),
            slow_tier: RateLimiter::dashmap(per_minute(cfg.rpm_slow, cfg.burst_size)),
            slow: DashSet::new(),
            clock: DefaultClock::default(),
            total_acquired: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cfg,
        }
    }

    fn tier_for(&self, host: &str) -> &KeyedLimiter {
        if self.slow.contains(host) {
            &self.slow_tier
        } else {
            &self.default_tier
        }
    }

    /// Take one cell for the host, waiting if needed. Returns whether
    /// the acquire had to wait (for the throttled/non-throttled
    /// counters), or `infra:ratelimit_timeout` when even the earliest
    /// possible cell lies past the deadline.
    pub async fn acquire(&self, host: &str, deadline: Instant) -> Result<bool, FailReason> {
        let limiter = self.tier_for(host);
        let key = host.to_string();

        if let Err(not_until) = limiter.check_key(&key) {
            let wait = not_until.wait_time_from(self.clock.now());
            if Instant::now() + wait > deadline {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(host, ?wait, "Rate limiter would exceed deadline");
                return Err(FailReason::RatelimitTimeout);
            }

            match tokio::time::timeout_at(deadline, limiter.until_key_ready(&key)).await {
                Ok(()) => {
                    self.total_acquired.fetch_add(1, Ordering::Relaxed);
                    self.throttled.fetch_add(1, Ordering::Relaxed);
                    return Ok(true);
                }
                Err(_) => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(FailReason::RatelimitTimeout);
                }
            }
        }

        self.total_acquired.fetch_add(1, Ordering::Relaxed);
        Ok(false)
    }

    /// Route the host to the slow quota. Its pending state in the
    /// default tier is simply abandoned; new acquires draw from a
    /// fresh slow-tier bucket.
    pub fn mark_slow(&self, host: &str) {
        if self.slow.insert(host.to_string()) {
            info!(host, rpm = self.cfg.rpm_slow, "Domain rate reduced");
        }
    }

    pub fn status(&self) -> RateLimiterStatus {
        RateLimiterStatus {
            domains_tracked: self.default_tier.len() + self.slow_tier.len(),
            slow_domains: self.slow.len(),
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            throttle_timeouts: self.timeouts.load(Ordering::Relaxed),
            default_rpm: self.cfg.rpm_default,
            slow_rpm: self.cfg.rpm_slow,
            burst_size: self.cfg.burst_size,
        }
    }
}

impl std::fmt::Debug for DomainRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRateLimiter")
            .field("slow_domains", &self.slow.len())
            .field("default_rpm", &self.cfg.rpm_default)
            .field("slow_rpm", &self.cfg.rpm_slow)
            .finish_non_exhaustive()
    }
}
