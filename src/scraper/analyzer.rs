//! Site analyzer: protection and rendering-model classification
//!
//! Works purely on the headers and body the prober already captured; no
//! additional network I/O happens here. Only the first 32 KiB of HTML
//! are examined.

use std::collections::HashMap;

use tracing::debug;

use crate::models::{Protection, SiteKind, SiteProfile};

/// How much of the body the detectors look at.
const ANALYSIS_WINDOW: usize = 32 * 1024;

/// Cloudflare challenge markers in the body.
const CLOUDFLARE_SIGNATURES: &[&str] = &[
    "just a moment...",
    "cf-browser-verification",
    "challenge-running",
    "cf_chl_opt",
    "checking your browser",
    "challenge-form",
];

const CAPTCHA_SIGNATURES: &[&str] = &[
    "g-recaptcha",
    "recaptcha/api.js",
    "hcaptcha.com",
    "h-captcha",
    "cf-turnstile",
    "data-sitekey",
];

const WAF_SIGNATURES: &[&str] = &[
    "mod_security",
    "modsecurity",
    "sucuri",
    "wordfence",
    "incapsula",
    "imperva",
    "access denied",
    "request blocked",
    "forbidden by administrative rules",
];

const RATE_LIMIT_SIGNATURES: &[&str] = &["too many requests", "rate limit", "limite de requisi"];

/// Markers of client-rendered shells.
const SPA_MOUNT_POINTS: &[&str] = &[
    "<div id=\"root\"></div>",
    "<div id=\"app\"></div>",
    "<div id=\"__next\"></div>",
    "<div id='root'></div>",
    "<div id='app'></div>",
];

const SPA_FRAMEWORK_HINTS: &[&str] = &[
    "__next_data__", "__nuxt", "ng-app", "ng-version", "data-reactroot", "data-v-", "vue",
    "webpack", "_app.js", "bundle.js",
];

/// Response captured by the winning probe, handed to the analyzer.
#[derive(Debug, Clone)]
pub struct ProbeCapture {
    pub url: String,
    pub http_status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub elapsed_ms: u64,
}

/// Classify protection and site kind from one probe capture.
pub fn analyze(capture: &ProbeCapture) -> SiteProfile {
    let mut cut = capture.body.len().min(ANALYSIS_WINDOW);
    while cut > 0 && !capture.body.is_char_boundary(cut) {
        cut -= 1;
    }
    let body = capture.body[..cut].to_ascii_lowercase();
    let headers: HashMap<String, String> = capture
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_ascii_lowercase()))
        .collect();

    let protection = detect_protection(&headers, &body, capture.http_status);
    let kind = detect_kind(&body);

    debug!(
        url = %capture.url,
        ?protection,
        ?kind,
        latency_ms = capture.elapsed_ms,
        "Site analyzed"
    );

    SiteProfile {
        reachable: true,
        protection,
        kind,
        latency_ms: capture.elapsed_ms,
        canonical_url: capture.url.clone(),
        cached_html: if capture.body.is_empty() {
            None
        } else {
            Some(capture.body.clone())
        },
    }
}

fn detect_protection(
    headers: &HashMap<String, String>,
    body: &str,
    status: u16,
) -> Protection {
    if status == 429 || headers.contains_key("retry-after") {
        return Protection::RateLimit;
    }

    let behind_cloudflare = headers.contains_key("cf-ray")
        || headers.get("server").is_some_and(|s| s.contains("cloudflare"));
    let challenged = CLOUDFLARE_SIGNATURES.iter().any(|sig| body.contains(sig));
    // Cloudflare in pass-through mode is not a protection; the
    // challenge page is.
    if behind_cloudflare && (challenged || status == 403 || status == 503) {
        return Protection::Cloudflare;
    }
    if challenged {
        return Protection::Cloudflare;
    }

    if CAPTCHA_SIGNATURES.iter().any(|sig| body.contains(sig)) {
        return Protection::Captcha;
    }

    let waf_hits = WAF_SIGNATURES.iter().filter(|sig| body.contains(*sig)).count();
    if waf_hits >= 1 && status == 403 {
        return Protection::Waf;
    }
    if waf_hits >= 2 {
        return Protection::Waf;
    }

    if RATE_LIMIT_SIGNATURES.iter().any(|sig| body.contains(sig)) {
        return Protection::RateLimit;
    }

    if status == 403 {
        return Protection::Unknown;
    }

    Protection::None
}

fn detect_kind(body: &str) -> SiteKind {
    let visible_estimate = visible_text_len(body);
    let empty_mount = SPA_MOUNT_POINTS.iter().any(|sig| body.contains(sig));
    if empty_mount && visible_estimate < 500 {
        return SiteKind::Spa;
    }

    let hints = SPA_FRAMEWORK_HINTS
        .iter()
        .filter(|sig| body.contains(*sig))
        .count();
    if hints >= 3 && visible_estimate < 2_000 {
        return SiteKind::Hybrid;
    }
    if hints >= 2 {
        return SiteKind::Hybrid;
    }

    SiteKind::Static
}

/// Cheap visible-text estimate: bytes outside tags, scripts stripped.
/// Good enough to separate a rendered page from an empty shell.
fn visible_text_len(body: &str) -> usize {
    let mut len = 0;
    let mut in_tag = false;
    let mut rest = body;

    while let Some(idx) = rest.find("<script") {
        len += count_text(&rest[..idx], &mut in_tag);
        match rest[idx..].find("</script>") {
            Some(end) => rest = &rest[idx + end + "</script>".len()..],
            None => return len,
        }
    }
    len + count_text(rest, &mut in_tag)
}

fn count_text(chunk: &str, in_tag: &mut bool) -> usize {
    let mut len = 0;
    for c in chunk.chars() {
        match c {
            '<' => *in_tag = true,
            '>' => *in_tag = false,
            _ if !*in_tag && !c.is_whitespace() => len += 1,
            _ => {}
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(status: u16, headers: &[(&str, &str)], body: &str) -> ProbeCapture {
        ProbeCapture {
            url: "https://acme.com.br".into(),
            http_status: status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body: body.to_string(),
            elapsed_ms: 120,
        }
    }

    fn rendered_page() -> String {
        format!(
            "<html><body><h1>Acme Industrial</h1><p>{}</p></body></html>",
            "Fabricamos soluções em aço para o setor industrial. ".repeat(30)
        )
    }

    #[test]
    fn test_clean_static_site() {
        let profile = analyze(&capture(200, &[("server", "nginx")], &rendered_page()));
        assert_eq!(profile.protection, Protection::None);
        assert_eq!(profile.kind, SiteKind::Static);
        assert!(profile.reachable);
        assert!(profile.cached_html.is_some());
    }

    #[test]
    fn test_cloudflare_challenge() {
        let body = "<html><body>Just a moment...<div class=\"challenge-form\"></div></body></html>";
        let profile = analyze(&capture(403, &[("cf-ray", "8abc-GRU"), ("server", "cloudflare")], body));
        assert_eq!(profile.protection, Protection::Cloudflare);
    }

    #[test]
    fn test_cloudflare_passthrough_is_not_protection() {
        let profile = analyze(&capture(
            200,
            &[("cf-ray", "8abc-GRU"), ("server", "cloudflare")],
            &rendered_page(),
        ));
        assert_eq!(profile.protection, Protection::None);
    }

    #[test]
    fn test_captcha_detection() {
        let body = format!("{}<div class=\"g-recaptcha\" data-sitekey=\"x\"></div>", rendered_page());
        let profile = analyze(&capture(200, &[], &body));
        assert_eq!(profile.protection, Protection::Captcha);
    }

    #[test]
    fn test_waf_on_403() {
        let body = "<html><body>Access denied by security policy</body></html>";
        let profile = analyze(&capture(403, &[], body));
        assert_eq!(profile.protection, Protection::Waf);
    }

    #[test]
    fn test_rate_limit_by_header() {
        let profile = analyze(&capture(200, &[("retry-after", "30")], &rendered_page()));
        assert_eq!(profile.protection, Protection::RateLimit);
    }

    #[test]
    fn test_rate_limit_by_status() {
        let profile = analyze(&capture(429, &[], ""));
        assert_eq!(profile.protection, Protection::RateLimit);
    }

    #[test]
    fn test_spa_empty_shell() {
        let body = r#"<html><body><div id="root"></div><script src="/static/js/main.js"></script></body></html>"#;
        let profile = analyze(&capture(200, &[], body));
        assert_eq!(profile.kind, SiteKind::Spa);
    }

    #[test]
    fn test_hybrid_with_framework_hints() {
        let body = format!(
            r#"<html><body data-reactroot=""><div>{}</div><script src="bundle.js"></script><script>window.__NEXT_DATA__={{}}</script></body></html>"#,
            "Conteúdo renderizado no servidor. ".repeat(100)
        );
        let profile = analyze(&capture(200, &[], &body.to_lowercase()));
        assert_eq!(profile.kind, SiteKind::Hybrid);
    }

    #[test]
    fn test_bare_403_is_unknown() {
        let profile = analyze(&capture(403, &[], "<html><body>Forbidden</body></html>"));
        assert_eq!(profile.protection, Protection::Unknown);
    }
}
