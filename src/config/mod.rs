//! Configuration management for the scraping fabric
//!
//! Configuration loads once at startup from a TOML file and/or
//! `GARIMPO_*` environment variables, is validated, and is treated as
//! immutable for the lifetime of the process.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration bundle for the fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Concurrency gate limits
    pub gate: GateConfig,

    /// Per-domain token-bucket rate limits
    pub rate: RateConfig,

    /// Per-domain circuit breaker
    pub breaker: BreakerConfig,

    /// Proxy pool behavior
    pub proxy: ProxyConfig,

    /// Fetch / probe timeouts and retry policy
    pub fetch: FetchConfig,

    /// Orchestration: subpage batches, rescue, deadlines
    pub scrape: ScrapeConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Global cap on in-flight requests
    pub global_concurrency: usize,

    /// Per-host cap
    pub per_domain_limit: usize,

    /// Per-host cap once the host is flagged slow
    pub slow_domain_limit: usize,

    /// Moving-p95 fetch time above which a host is flagged slow
    pub slow_threshold_ms: u64,

    /// Bound on waiting for a slot (global + per-host share it)
    pub acquire_timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 200,
            per_domain_limit: 5,
            slow_domain_limit: 2,
            slow_threshold_ms: 8_000,
            acquire_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    /// Requests per minute for non-slow hosts
    pub rpm_default: u32,

    /// Requests per minute for hosts flagged slow
    pub rpm_slow: u32,

    /// Token-bucket burst capacity
    pub burst_size: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            rpm_default: 300,
            rpm_slow: 60,
            burst_size: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub breaker_threshold: u32,

    /// OPEN -> HALF_OPEN delay
    pub breaker_recovery_ms: u64,

    /// Probes admitted in HALF_OPEN
    pub breaker_half_open_max: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            breaker_threshold: 12,
            breaker_recovery_ms: 30_000,
            breaker_half_open_max: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Path to the proxy list (IP:PORT:USER:PASS per line)
    pub list_path: Option<String>,

    /// Success-rate floor below which a proxy loses its selection weight
    pub proxy_min_success_rate: f64,

    /// Observations required before the floor applies
    pub proxy_min_observations: u64,

    /// Consecutive failures before quarantine
    pub proxy_max_failures: u32,

    /// Quarantine duration
    pub proxy_quarantine_secs: u64,

    /// Known-good target used for the startup health check
    pub health_check_url: String,

    /// Health-check timeout per proxy
    pub health_check_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            list_path: None,
            proxy_min_success_rate: 0.10,
            proxy_min_observations: 8,
            proxy_max_failures: 3,
            proxy_quarantine_secs: 120,
            health_check_url: String::from("https://www.gstatic.com/generate_204"),
            health_check_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// URL prober deadline across all four variants
    pub probe_timeout_ms: u64,

    /// Per-request deadline for fast-path fetches
    pub fetch_timeout_ms_fast: u64,

    /// Per-request deadline for robust/aggressive fetches
    pub fetch_timeout_ms_slow: u64,

    /// Fresh-proxy retries per strategy
    pub max_retries: u32,

    /// Delay before a retry (retries are immediate by default)
    pub retry_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 10_000,
            fetch_timeout_ms_fast: 12_000,
            fetch_timeout_ms_slow: 15_000,
            max_retries: 1,
            retry_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    /// Subpage mini-batch size
    pub batch_size: usize,

    /// Delay between requests inside one mini-batch
    pub intra_batch_delay_ms: u64,

    /// Delay between mini-batches
    pub inter_batch_delay_ms: u64,

    /// Main-page text length below which rescue subpages are attempted
    pub rescue_min_chars: usize,

    /// Link-selection cap
    pub max_subpages: usize,

    /// Overall per-company deadline
    pub company_deadline_ms: u64,

    /// Batch worker count
    pub workers: usize,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            intra_batch_delay_ms: 0,
            inter_batch_delay_ms: 0,
            rescue_min_chars: 500,
            max_subpages: 5,
            company_deadline_ms: 90_000,
            workers: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            gate: GateConfig::default(),
            rate: RateConfig::default(),
            breaker: BreakerConfig::default(),
            proxy: ProxyConfig::default(),
            fetch: FetchConfig::default(),
            scrape: ScrapeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl FabricConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("GARIMPO_GLOBAL_CONCURRENCY") {
            config.gate.global_concurrency = v;
        }
        if let Some(v) = env_parse("GARIMPO_PER_DOMAIN_LIMIT") {
            config.gate.per_domain_limit = v;
        }
        if let Some(v) = env_parse("GARIMPO_SLOW_DOMAIN_LIMIT") {
            config.gate.slow_domain_limit = v;
        }
        if let Some(v) = env_parse("GARIMPO_RPM_DEFAULT") {
            config.rate.rpm_default = v;
        }
        if let Some(v) = env_parse("GARIMPO_RPM_SLOW") {
            config.rate.rpm_slow = v;
        }
        if let Some(v) = env_parse("GARIMPO_BURST_SIZE") {
            config.rate.burst_size = v;
        }
        if let Some(v) = env_parse("GARIMPO_BREAKER_THRESHOLD") {
            config.breaker.breaker_threshold = v;
        }
        if let Some(v) = env_parse("GARIMPO_BREAKER_RECOVERY_MS") {
            config.breaker.breaker_recovery_ms = v;
        }
        if let Some(v) = env_parse("GARIMPO_PROBE_TIMEOUT_MS") {
            config.fetch.probe_timeout_ms = v;
        }
        if let Some(v) = env_parse("GARIMPO_MAX_RETRIES") {
            config.fetch.max_retries = v;
        }
        if let Some(v) = env_parse("GARIMPO_MAX_SUBPAGES") {
            config.scrape.max_subpages = v;
        }
        if let Some(v) = env_parse("GARIMPO_WORKERS") {
            config.scrape.workers = v;
        }
        if let Ok(v) = std::env::var("GARIMPO_PROXY_LIST") {
            config.proxy.list_path = Some(v);
        }
        if let Ok(v) = std::env::var("GARIMPO_LOG_LEVEL") {
            config.logging.level = v;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.gate.global_concurrency == 0 {
            anyhow::bail!("global_concurrency must be greater than 0");
        }
        if self.gate.per_domain_limit == 0 || self.gate.slow_domain_limit == 0 {
            anyhow::bail!("per_domain_limit and slow_domain_limit must be greater than 0");
        }
        if self.gate.slow_domain_limit > self.gate.per_domain_limit {
            anyhow::bail!("slow_domain_limit must not exceed per_domain_limit");
        }
        if self.rate.rpm_default == 0 || self.rate.rpm_slow == 0 {
            anyhow::bail!("rpm_default and rpm_slow must be greater than 0");
        }
        if self.rate.burst_size == 0 {
            anyhow::bail!("burst_size must be greater than 0");
        }
        if self.breaker.breaker_threshold == 0 {
            anyhow::bail!("breaker_threshold must be greater than 0");
        }
        if self.breaker.breaker_half_open_max == 0 {
            anyhow::bail!("breaker_half_open_max must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.proxy.proxy_min_success_rate) {
            anyhow::bail!("proxy_min_success_rate must be within [0, 1]");
        }
        if self.scrape.workers == 0 {
            anyhow::bail!("workers must be greater than 0");
        }
        Ok(())
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch.probe_timeout_ms)
    }

    #[must_use]
    pub fn company_deadline(&self) -> Duration {
        Duration::from_millis(self.scrape.company_deadline_ms)
    }

    /// Per-request deadline for a given strategy tier.
    #[must_use]
    pub fn request_timeout(&self, slow: bool) -> Duration {
        if slow {
            Duration::from_millis(self.fetch.fetch_timeout_ms_slow)
        } else {
            Duration::from_millis(self.fetch.fetch_timeout_ms_fast)
        }
    }
}
