//! Unified error handling for the garimpo crate
//!
//! Two layers live here:
//!
//! - [`FailReason`] - the closed failure taxonomy every fetch, probe and
//!   orchestration outcome is classified into at its point of origin.
//!   Higher layers aggregate these reasons; they never reclassify.
//! - [`Error`] - the unified error enum used across module boundaries
//!   for configuration, I/O and transport failures.

use std::io;
use thiserror::Error;

/// Closed failure taxonomy.
///
/// Every failure in the scraping fabric is classified into exactly one
/// of these reasons at the point where it is observed. The string forms
/// (`probe:timeout`, `proxy:http_403`, ...) are stable: they appear in
/// the batch status object's `error_breakdown`, `main_page_fail_reasons`
/// and `subpage_error_breakdown` maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailReason {
    /// No URL variant responded within the probe deadline
    ProbeTimeout,
    /// TLS handshake failed on every reachable variant
    ProbeSsl,
    /// All variants returned 5xx
    ProbeServerError,
    /// All variants returned 403/451 or a WAF challenge
    ProbeBlocked,
    /// Other probe failure
    ProbeUnknown,
    /// Connected but the read exceeded the deadline
    ProxyTimeout,
    /// Reset / refused / broken pipe
    ProxyConnection,
    /// 200 with an empty or soft-404 body
    ProxyEmptyResponse,
    /// Upstream 500-599
    ProxyHttp5xx,
    /// Upstream 403
    ProxyHttp403,
    /// Upstream 429
    ProxyHttp429,
    /// Any other upstream HTTP status outside 200-399
    ProxyOther,
    /// Parser or decoding failure on a non-empty body
    ScrapeError,
    /// Concurrency gate timed out
    ConcurrencyTimeout,
    /// Rate limiter timed out
    RatelimitTimeout,
    /// Circuit breaker rejected the request
    CircuitOpen,
    /// Request cancelled mid-flight by the company deadline
    Cancelled,
    /// Overall company deadline expired
    Deadline,
}

impl FailReason {
    /// Stable string form used in status objects and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProbeTimeout => "probe:timeout",
            Self::ProbeSsl => "probe:ssl",
            Self::ProbeServerError => "probe:server_error",
            Self::ProbeBlocked => "probe:blocked",
            Self::ProbeUnknown => "probe:unknown",
            Self::ProxyTimeout => "proxy:timeout",
            Self::ProxyConnection => "proxy:connection",
            Self::ProxyEmptyResponse => "proxy:empty_response",
            Self::ProxyHttp5xx => "proxy:http_5xx",
            Self::ProxyHttp403 => "proxy:http_403",
            Self::ProxyHttp429 => "proxy:http_429",
            Self::ProxyOther => "proxy:other",
            Self::ScrapeError => "scrape:error",
            Self::ConcurrencyTimeout => "infra:concurrency_timeout",
            Self::RatelimitTimeout => "infra:ratelimit_timeout",
            Self::CircuitOpen => "infra:circuit_open",
            Self::Cancelled => "infra:cancelled",
            Self::Deadline => "infra:deadline",
        }
    }

    /// Whether the batch layer may retry a company that failed with this
    /// reason. Permanent reasons (SSL, blocked, soft-404) are not worth
    /// a second pass; infrastructure rejections and flaky transport are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProbeTimeout
                | Self::ProxyTimeout
                | Self::ProxyConnection
                | Self::ProxyHttp5xx
                | Self::ProxyHttp429
                | Self::ConcurrencyTimeout
                | Self::RatelimitTimeout
                | Self::CircuitOpen
        )
    }

    /// Whether this reason belongs to the probe stage.
    pub fn is_probe(&self) -> bool {
        matches!(
            self,
            Self::ProbeTimeout
                | Self::ProbeSsl
                | Self::ProbeServerError
                | Self::ProbeBlocked
                | Self::ProbeUnknown
        )
    }

    /// Severity rank used by the prober to pick the most informative
    /// reason when every variant failed. Higher wins.
    pub(crate) fn probe_severity(&self) -> u8 {
        match self {
            Self::ProbeBlocked => 5,
            Self::ProbeServerError => 4,
            Self::ProbeSsl => 3,
            Self::ProbeTimeout => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for FailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl serde::Serialize for FailReason {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Unified error type for the garimpo crate
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (invalid or missing values)
    #[error("Config error: {0}")]
    Config(String),

    /// I/O errors (proxy list file, config file)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client construction / transport errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing errors
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A company could not be scraped; carries the taxonomised reason
    #[error("Scrape failed: {reason}")]
    ScrapeFailed { reason: FailReason },

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings_are_stable() {
        assert_eq!(FailReason::ProbeTimeout.as_str(), "probe:timeout");
        assert_eq!(FailReason::ProxyHttp403.as_str(), "proxy:http_403");
        assert_eq!(FailReason::CircuitOpen.as_str(), "infra:circuit_open");
        assert_eq!(FailReason::Cancelled.as_str(), "infra:cancelled");
    }

    #[test]
    fn test_transient_classification() {
        assert!(FailReason::ProxyTimeout.is_transient());
        assert!(FailReason::ProxyHttp5xx.is_transient());
        assert!(FailReason::CircuitOpen.is_transient());
        assert!(!FailReason::ProbeSsl.is_transient());
        assert!(!FailReason::ProbeBlocked.is_transient());
        assert!(!FailReason::ProxyEmptyResponse.is_transient());
    }

    #[test]
    fn test_probe_severity_order() {
        assert!(
            FailReason::ProbeBlocked.probe_severity() > FailReason::ProbeServerError.probe_severity()
        );
        assert!(FailReason::ProbeServerError.probe_severity() > FailReason::ProbeSsl.probe_severity());
        assert!(FailReason::ProbeSsl.probe_severity() > FailReason::ProbeTimeout.probe_severity());
        assert!(FailReason::ProbeTimeout.probe_severity() > FailReason::ProbeUnknown.probe_severity());
    }

    #[test]
    fn test_reason_serializes_as_string() {
        let json = serde_json::to_string(&FailReason::ProxyEmptyResponse).unwrap();
        assert_eq!(json, "\"proxy:empty_response\"");
    }
}
