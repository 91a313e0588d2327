//! URL normalisation, probe-variant generation and registrable-domain
//! extraction.
//!
//! The registrable domain (`example.com.br`, not `loja.example.com.br`)
//! keys every per-host structure in the fabric: the concurrency gate,
//! the rate limiter and the circuit breaker.

use url::Url;

use crate::error::{Error, Result};

/// Multi-label public suffixes common in the target corpus. Anything
/// else is treated as a single-label suffix.
const MULTI_LABEL_SUFFIXES: &[&str] = &[
    "com.br", "net.br", "org.br", "gov.br", "edu.br", "ind.br", "adv.br", "eng.br", "art.br",
    "co.uk", "org.uk", "ac.uk", "com.au", "com.ar", "com.mx", "com.pt", "com.co",
];

/// Parse a raw URL, defaulting to `https://` when the scheme is absent.
pub fn normalize(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::other("empty URL"));
    }

    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let url = Url::parse(&with_scheme)?;
    if url.host_str().is_none() {
        return Err(Error::other(format!("URL has no host: {raw}")));
    }
    Ok(url)
}

/// The registrable domain of a URL: the public suffix plus one label.
///
/// Falls back to the full host for IPs and single-label hosts.
pub fn registrable_domain(url: &Url) -> String {
    let host = match url.host_str() {
        Some(h) => h.to_ascii_lowercase(),
        None => return String::from("unknown"),
    };

    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host;
    }

    for suffix in MULTI_LABEL_SUFFIXES {
        if host.ends_with(&format!(".{suffix}")) || host == *suffix {
            let suffix_labels = suffix.split('.').count();
            let keep = suffix_labels + 1;
            if labels.len() >= keep {
                return labels[labels.len() - keep..].join(".");
            }
            return host;
        }
    }

    labels[labels.len() - 2..].join(".")
}

/// Registrable domain straight from a raw URL string; `unknown` when
/// the string does not parse.
pub fn host_key(raw: &str) -> String {
    match normalize(raw) {
        Ok(url) => registrable_domain(&url),
        Err(_) => String::from("unknown"),
    }
}

/// The four probe variants `{https,http} x {www,apex}`, https and www
/// first, deduplicated, preserving the original path and port. IP
/// hosts get no `www.` variants.
pub fn probe_variants(raw: &str) -> Result<Vec<String>> {
    let url = normalize(raw)?;
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let is_ip = host.parse::<std::net::IpAddr>().is_ok();
    let apex = host.strip_prefix("www.").unwrap_or(&host).to_string();
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    let path = match url.path() {
        "/" | "" => String::new(),
        p => p.trim_end_matches('/').to_string(),
    };

    let prefixes: &[&str] = if is_ip { &[""] } else { &["www.", ""] };
    let mut variants = Vec::with_capacity(4);
    for scheme in ["https", "http"] {
        for prefix in prefixes {
            let candidate = format!("{scheme}://{prefix}{apex}{port}{path}");
            if !variants.contains(&candidate) {
                variants.push(candidate);
            }
        }
    }
    Ok(variants)
}

/// Strip fragment and trailing slash so query-only and anchor-only
/// variants of the same page collapse.
pub fn normalize_page_url(url: &Url) -> String {
    let mut u = url.clone();
    u.set_fragment(None);
    let s = u.to_string();
    s.trim_end_matches('/').to_string()
}

/// Path depth: number of non-empty path segments.
pub fn path_depth(url: &Url) -> usize {
    url.path_segments()
        .map(|segs| segs.filter(|s| !s.is_empty()).count())
        .unwrap_or(0)
}
