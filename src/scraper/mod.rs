//! The scraping fabric
//!
//! Component layering, leaves first: proxy pool, concurrency gate, rate
//! limiter, circuit breaker, fetcher, prober, analyzer, strategy
//! selector, orchestrator, batch processor. The orchestrator is the
//! only component that touches more than one per-host map for a given
//! call; the maps themselves are independent and never hold references
//! to each other.

pub mod analyzer;
pub mod batch;
pub mod breaker;
pub mod fetcher;
pub mod gate;
pub mod headers;
pub mod limiter;
pub mod orchestrator;
pub mod prober;
pub mod proxy;
pub mod strategy;
pub mod url;

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::config::FabricConfig;
use crate::metrics::ScrapeMetrics;
use crate::models::Strategy;

use breaker::CircuitBreaker;
use fetcher::Fetcher;
use gate::ConcurrencyGate;
use limiter::DomainRateLimiter;
use proxy::ProxyPool;

/// Everything a worker needs to scrape, as one explicit context value.
/// One context per process; tests build a fresh one each.
#[derive(Debug)]
pub struct ScrapeContext {
    pub config: Arc<FabricConfig>,
    pub proxies: Arc<ProxyPool>,
    pub gate: Arc<ConcurrencyGate>,
    pub limiter: Arc<DomainRateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub fetcher: Arc<Fetcher>,
    pub metrics: Arc<ScrapeMetrics>,

    /// Strategy that worked per domain, for the process lifetime
    pub(crate) domain_strategies: DashMap<String, Strategy>,
}

impl ScrapeContext {
    /// Build a context with an empty proxy pool (direct connections).
    pub fn new(config: FabricConfig) -> Arc<Self> {
        Self::with_proxies(config, Vec::new())
    }

    /// Build a context over the given proxy endpoints.
    pub fn with_proxies(config: FabricConfig, proxy_endpoints: Vec<String>) -> Arc<Self> {
        let pool = ProxyPool::new(proxy_endpoints, &config.proxy);
        Arc::new(Self {
            proxies: Arc::new(pool),
            gate: Arc::new(ConcurrencyGate::new(config.gate.clone())),
            limiter: Arc::new(DomainRateLimiter::new(config.rate.clone())),
            breaker: Arc::new(CircuitBreaker::new(config.breaker.clone())),
            fetcher: Arc::new(Fetcher::new()),
            metrics: Arc::new(ScrapeMetrics::new()),
            domain_strategies: DashMap::new(),
            config: Arc::new(config),
        })
    }

    /// Remember the strategy that worked for a domain.
    pub(crate) fn remember_strategy(&self, host: &str, strategy: Strategy) {
        self.domain_strategies.insert(host.to_string(), strategy);
    }

    pub(crate) fn remembered_strategy(&self, host: &str) -> Option<Strategy> {
        self.domain_strategies.get(host).map(|s| *s)
    }

    /// Infrastructure snapshot for the batch status object.
    pub fn infrastructure(&self) -> InfrastructureStatus {
        InfrastructureStatus {
            proxy_pool: self.proxies.status(),
            concurrency: self.gate.status(),
            rate_limiter: self.limiter.status(),
            circuit_breaker: self.breaker.status(),
        }
    }
}

/// `infrastructure` section of the status object.
#[derive(Debug, Clone, Serialize)]
pub struct InfrastructureStatus {
    pub proxy_pool: proxy::ProxyPoolStatus,
    pub concurrency: gate::GateStatus,
    pub rate_limiter: limiter::RateLimiterStatus,
    pub circuit_breaker: breaker::BreakerStatus,
}
