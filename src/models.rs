//! Core data structures shared across the scraping fabric.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::FailReason;

/// One input item of a batch: minimal identifiers for one company.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyInput {
    /// Short registration number (CNPJ base)
    pub registration_id: String,

    /// Candidate website URL, if already known
    #[serde(default)]
    pub url: Option<String>,

    /// Trade name, used by the search-engine client when `url` is absent
    #[serde(default)]
    pub trade_name: Option<String>,

    /// City, narrows the candidate search
    #[serde(default)]
    pub city: Option<String>,
}

/// Protection detected on a site during analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protection {
    None,
    Cloudflare,
    Waf,
    Captcha,
    RateLimit,
    Unknown,
}

/// Kind of site: classic server-rendered, client-rendered, or in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteKind {
    Static,
    Spa,
    Hybrid,
}

/// Named bundle of HTTP-client settings used for one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Clean sites: short timeouts, stable UA
    Fast,
    /// Default
    Standard,
    /// Slow or flaky sites: long timeouts
    Robust,
    /// Cloudflare/WAF suspected: rotating UA pool, long read timeout
    Aggressive,
}

/// Concrete client settings for one strategy.
#[derive(Debug, Clone, Copy)]
pub struct StrategySettings {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub rotate_user_agent: bool,
    pub follow_redirects: bool,
}

impl Strategy {
    /// Client settings per the strategy table. Timeouts are fixed by
    /// strategy; the per-request deadline may shorten them further.
    pub fn settings(&self) -> StrategySettings {
        match self {
            Self::Fast => StrategySettings {
                connect_timeout_ms: 8_000,
                read_timeout_ms: 10_000,
                rotate_user_agent: false,
                follow_redirects: true,
            },
            Self::Standard => StrategySettings {
                connect_timeout_ms: 10_000,
                read_timeout_ms: 15_000,
                rotate_user_agent: false,
                follow_redirects: true,
            },
            Self::Robust => StrategySettings {
                connect_timeout_ms: 12_000,
                read_timeout_ms: 20_000,
                rotate_user_agent: false,
                follow_redirects: true,
            },
            Self::Aggressive => StrategySettings {
                connect_timeout_ms: 10_000,
                read_timeout_ms: 20_000,
                rotate_user_agent: true,
                follow_redirects: true,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Robust => "robust",
            Self::Aggressive => "aggressive",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Profile of a single site produced by the analyzer from the probe
/// response. `reachable` implies `canonical_url` is one of the four
/// probed variants.
#[derive(Debug, Clone)]
pub struct SiteProfile {
    pub reachable: bool,
    pub protection: Protection,
    pub kind: SiteKind,
    pub latency_ms: u64,
    pub canonical_url: String,
    /// HTML captured by the winning probe, reused by the main-page
    /// stage when exploitable (saves one network round trip).
    pub cached_html: Option<String>,
}

/// Result of one `(url, proxy, strategy)` fetch attempt.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Ok(FetchedPage),
    Fail(FetchFailure),
}

/// Successful fetch: 2xx/3xx status, non-empty body, not a soft 404.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Decoded body (HTML), capped at the parser's extraction budget
    pub body: String,
    /// Raw body size in bytes before decoding
    pub bytes: usize,
    pub http_status: u16,
    pub final_url: String,
    pub elapsed_ms: u64,
}

/// Failed fetch, classified at origin.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub reason: FailReason,
    /// HTTP status when the failure came from a status code
    pub http_status: Option<u16>,
    pub elapsed_ms: u64,
}

impl FetchOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn fail_reason(&self) -> Option<FailReason> {
        match self {
            Self::Ok(_) => None,
            Self::Fail(f) => Some(f.reason),
        }
    }

    pub(crate) fn failure(reason: FailReason, elapsed_ms: u64) -> Self {
        Self::Fail(FetchFailure {
            reason,
            http_status: None,
            elapsed_ms,
        })
    }
}

/// One page delivered downstream: url, extracted text, raw byte count.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapedPage {
    pub url: String,
    pub text: String,
    pub bytes: usize,
}

/// Per-company subpage accounting.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubpageStats {
    pub attempted: u64,
    pub ok: u64,
    pub failed: u64,
    pub reason_histogram: HashMap<FailReason, u64>,
}

impl SubpageStats {
    pub fn record_failure(&mut self, reason: FailReason) {
        self.failed += 1;
        *self.reason_histogram.entry(reason).or_insert(0) += 1;
    }
}

/// Final result of scraping one company.
///
/// Invariant: exactly one of `pages` non-empty / `main_page_fail_reason`
/// set holds.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeResult {
    pub pages: Vec<ScrapedPage>,
    pub main_page_fail_reason: Option<FailReason>,
    pub subpage_stats: SubpageStats,
    pub links_seen: u64,
    pub links_filtered: u64,
    pub links_selected: u64,
    pub retries: u32,
    pub elapsed_ms: u64,
}

impl ScrapeResult {
    pub fn failed(reason: FailReason, elapsed_ms: u64) -> Self {
        Self {
            pages: Vec::new(),
            main_page_fail_reason: Some(reason),
            subpage_stats: SubpageStats::default(),
            links_seen: 0,
            links_filtered: 0,
            links_selected: 0,
            retries: 0,
            elapsed_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.pages.is_empty()
    }

    /// Concatenated page text in the framing the downstream chunker
    /// expects.
    pub fn aggregated_text(&self) -> String {
        self.pages
            .iter()
            .map(|p| format!("--- PAGE START: {} ---\n{}\n--- PAGE END ---", p.url, p.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
