//! Single-responsibility HTTP fetch primitive
//!
//! One call = one `(url, proxy, strategy)` attempt, classified into the
//! failure taxonomy at the point of origin. The fetcher itself never
//! retries; retry belongs to the orchestrator and always uses a freshly
//! borrowed proxy.

use std::time::Duration;

use dashmap::DashMap;
use reqwest::redirect::Policy;
use tokio::time::Instant;
use tracing::debug;

use crate::error::FailReason;
use crate::models::{FetchFailure, FetchOutcome, FetchedPage, Strategy};
use crate::parser::html::{body_signature, decode_body, looks_like_soft_404};
use crate::scraper::headers::{build_browser_headers, default_user_agent, random_user_agent};
use crate::scraper::proxy::Proxy;
use crate::scraper::url::host_key;

/// Raw download cap. Decoded text is bounded again by the parser; this
/// bound keeps a runaway response from ballooning memory first.
const MAX_RAW_BYTES: usize = 2 * 1024 * 1024;

/// HTTP fetcher. Holds the per-host canonical-404 signature cache used
/// as the third soft-404 signal.
#[derive(Debug, Default)]
pub struct Fetcher {
    canonical_404: DashMap<String, u64>,
}

impl Fetcher {
    pub fn new() -> Self {
        Self {
            canonical_404: DashMap::new(),
        }
    }

    /// Fetch one URL through one proxy with one strategy.
    ///
    /// Success means: HTTP status in 200-399, a non-empty decoded body,
    /// and no soft-404 signature. Everything else comes back as a
    /// classified failure.
    pub async fn fetch(
        &self,
        url: &str,
        proxy: Option<&Proxy>,
        strategy: Strategy,
        deadline: Instant,
    ) -> FetchOutcome {
        let start = Instant::now();
        let settings = strategy.settings();

        let user_agent = if settings.rotate_user_agent {
            random_user_agent()
        } else {
            default_user_agent()
        };

        let mut builder = reqwest::Client::builder()
            .default_headers(build_browser_headers(user_agent))
            .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
            .timeout(Duration::from_millis(settings.read_timeout_ms))
            .redirect(if settings.follow_redirects {
                Policy::limited(5)
            } else {
                Policy::none()
            })
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .danger_accept_invalid_certs(true);

        if let Some(proxy) = proxy {
            builder = match reqwest::Proxy::all(&proxy.endpoint) {
                Ok(p) => builder.proxy(p),
                Err(e) => {
                    debug!(proxy_id = proxy.id, error = %e, "Bad proxy endpoint");
                    return FetchOutcome::failure(FailReason::ProxyConnection, 0);
                }
            };
        }

        let client = match builder.build() {
            Ok(c) => c,
            Err(_) => return FetchOutcome::failure(FailReason::ProxyConnection, 0),
        };

        let response = match tokio::time::timeout_at(deadline, client.get(url).send()).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                let reason = classify_transport_error(&e);
                return FetchOutcome::Fail(FetchFailure {
                    reason,
                    http_status: None,
                    elapsed_ms: elapsed_ms(start),
                });
            }
            Err(_) => {
                return FetchOutcome::failure(FailReason::ProxyTimeout, elapsed_ms(start));
            }
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = match read_body_capped(response, deadline).await {
            Ok(b) => b,
            Err(reason) => {
                return FetchOutcome::failure(reason, elapsed_ms(start));
            }
        };

        let elapsed = elapsed_ms(start);

        if !(200..=399).contains(&status) {
            let reason = match status {
                500..=599 => FailReason::ProxyHttp5xx,
                403 => FailReason::ProxyHttp403,
                429 => FailReason::ProxyHttp429,
                _ => FailReason::ProxyOther,
            };
            // A real 404 teaches us the host's "not found" page, so a
            // later 200 serving the same body is caught as a soft 404.
            if status == 404 && !bytes.is_empty() {
                let body = decode_body(&bytes, content_type.as_deref());
                if !body.is_empty() {
                    self.canonical_404
                        .insert(host_key(url), body_signature(&body));
                }
            }
            return FetchOutcome::Fail(FetchFailure {
                reason,
                http_status: Some(status),
                elapsed_ms: elapsed,
            });
        }

        let raw_len = bytes.len();
        let body = decode_body(&bytes, content_type.as_deref());

        if body.trim().is_empty() {
            return FetchOutcome::Fail(FetchFailure {
                reason: FailReason::ProxyEmptyResponse,
                http_status: Some(status),
                elapsed_ms: elapsed,
            });
        }

        if self.is_soft_404(url, &body) {
            return FetchOutcome::Fail(FetchFailure {
                reason: FailReason::ProxyEmptyResponse,
                http_status: Some(status),
                elapsed_ms: elapsed,
            });
        }

        FetchOutcome::Ok(FetchedPage {
            body,
            bytes: raw_len,
            http_status: status,
            final_url,
            elapsed_ms: elapsed,
        })
    }

    /// Soft-404: tiny body, a "not found" signature, or identity with
    /// the host's cached canonical 404 HTML.
    fn is_soft_404(&self, url: &str, body: &str) -> bool {
        if looks_like_soft_404(body) {
            return true;
        }
        if let Some(cached) = self.canonical_404.get(&host_key(url)) {
            return *cached == body_signature(body);
        }
        false
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Stream the body with a hard cap; a runaway response is truncated,
/// not rejected.
async fn read_body_capped(
    mut response: reqwest::Response,
    deadline: Instant,
) -> Result<Vec<u8>, FailReason> {
    let mut out: Vec<u8> = Vec::new();
    loop {
        let chunk = match tokio::time::timeout_at(deadline, response.chunk()).await {
            Ok(Ok(Some(chunk))) => chunk,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => return Err(classify_transport_error(&e)),
            Err(_) => return Err(FailReason::ProxyTimeout),
        };
        if out.len() + chunk.len() > MAX_RAW_BYTES {
            out.extend_from_slice(&chunk[..MAX_RAW_BYTES - out.len()]);
            break;
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Map a transport error into the taxonomy. TLS handshake failures
/// classify as connection errors here; the prober does its own
/// mapping to `probe:ssl`.
fn classify_transport_error(e: &reqwest::Error) -> FailReason {
    if error_chain_mentions_tls(e) {
        return FailReason::ProxyConnection;
    }
    if e.is_timeout() {
        return FailReason::ProxyTimeout;
    }
    FailReason::ProxyConnection
}

fn error_chain_mentions_tls(e: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(e);
    while let Some(err) = source {
        let text = err.to_string().to_ascii_lowercase();
        if text.contains("certificate")
            || text.contains("handshake")
            || text.contains("tls")
            || text.contains("ssl")
        {
            return true;
        }
        source = err.source();
    }
    false
}
