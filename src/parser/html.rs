//! Bounded HTML text extraction and soft-404 detection
//!
//! Brazilian SMB sites routinely serve ISO-8859-1 / windows-1252 with a
//! missing or wrong charset header, so decoding runs through charset
//! detection before parsing. Extraction is allocation-bounded: a runaway
//! page is truncated, never rejected, so whatever text was already
//! extracted survives.

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use scraper::{Html, Selector};

/// Cap on extracted text per page after decoding.
pub const MAX_EXTRACT_BYTES: usize = 1024 * 1024;

/// Body sizes under this are treated as a soft-404 signal.
pub const SOFT_404_MIN_BYTES: usize = 500;

/// Substrings that flag an HTTP 200 page as "not found" to a human
/// reader. Checked lowercase.
const NOT_FOUND_SIGNATURES: &[&str] = &[
    "404 not found",
    "page not found",
    "error 404",
    "file not found",
    "página não encontrada",
    "pagina nao encontrada",
    "não encontramos a página",
    "página inexistente",
    "erro 404",
];

/// Decode a response body to a string.
///
/// Order: Content-Type charset, meta-tag charset in the first 2 KiB,
/// UTF-8, windows-1252 fallback (accepts any byte sequence). PDF bodies
/// are never decoded as HTML and yield an empty string.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    if is_pdf(bytes, content_type) {
        return String::new();
    }

    if let Some(encoding) = charset_from_content_type(content_type) {
        let (text, _, _) = encoding.decode(bytes);
        return text.into_owned();
    }

    if let Some(encoding) = charset_from_meta(bytes) {
        let (text, _, _) = encoding.decode(bytes);
        return text.into_owned();
    }

    let (text, _, had_errors) = UTF_8.decode(bytes);
    if !had_errors {
        return text.into_owned();
    }

    let (text, _, _) = WINDOWS_1252.decode(bytes);
    text.into_owned()
}

/// PDF guard: magic bytes or Content-Type.
pub fn is_pdf(bytes: &[u8], content_type: Option<&str>) -> bool {
    if let Some(ct) = content_type {
        if ct.to_ascii_lowercase().contains("application/pdf") {
            return true;
        }
    }
    bytes.starts_with(b"%PDF-")
}

fn charset_from_content_type(content_type: Option<&str>) -> Option<&'static Encoding> {
    let ct = content_type?.to_ascii_lowercase();
    let charset = ct.split("charset=").nth(1)?;
    let name = charset.split(';').next()?.trim().trim_matches('"');
    Encoding::for_label(name.as_bytes())
}

/// Look for a charset declaration in the first 2 KiB of the document.
fn charset_from_meta(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = &bytes[..bytes.len().min(2048)];
    let head_str = String::from_utf8_lossy(head).to_ascii_lowercase();
    let idx = head_str.find("charset=")?;
    let rest = &head_str[idx + "charset=".len()..];
    let name: String = rest
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if name.is_empty() {
        return None;
    }
    Encoding::for_label(name.as_bytes())
}

/// Extract readable text from HTML, skipping script/style/noscript,
/// capped at [`MAX_EXTRACT_BYTES`].
///
/// The parser holds no lock and runs inline on the calling task.
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let skip = Selector::parse("script, style, noscript, svg, head").unwrap();

    let skipped: std::collections::HashSet<_> = document
        .select(&skip)
        .flat_map(|el| el.descendants().map(|n| n.id()))
        .collect();

    let mut out = String::new();
    for node in document.tree.nodes() {
        if skipped.contains(&node.id()) {
            continue;
        }
        if let Some(text) = node.value().as_text() {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            if out.len() + trimmed.len() + 1 > MAX_EXTRACT_BYTES {
                let room = MAX_EXTRACT_BYTES.saturating_sub(out.len() + 1);
                let mut cut = room;
                while cut > 0 && !trimmed.is_char_boundary(cut) {
                    cut -= 1;
                }
                if cut > 0 {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(&trimmed[..cut]);
                }
                break;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(trimmed);
        }
    }
    out
}

/// Panic-isolated extraction. A parser panic on a malformed page must
/// kill that page only, never the worker's company; the caller
/// classifies `None` as `scrape:error`.
pub fn try_extract_text(html: &str) -> Option<String> {
    std::panic::catch_unwind(|| extract_text(html)).ok()
}

/// Soft-404 check over the decoded body: tiny body or a "not found"
/// signature. The third signal (identity with the host's cached
/// canonical 404 HTML) lives in the fetcher, which owns that cache.
pub fn looks_like_soft_404(body: &str) -> bool {
    if body.len() < SOFT_404_MIN_BYTES {
        return true;
    }
    let lower = body.to_lowercase();
    NOT_FOUND_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Stable content signature used for canonical-404 identity matching.
pub fn body_signature(body: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    body.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_html(text: &str) -> String {
        // Pad past the soft-404 size floor
        format!(
            "<html><body><p>{text}</p><p>{}</p></body></html>",
            "x".repeat(SOFT_404_MIN_BYTES)
        )
    }

    #[test]
    fn test_extract_text_skips_scripts() {
        let html = r#"<html><head><script>var x = "hidden";</script></head>
            <body><h1>Empresa Acme</h1><style>.a{}</style><p>Soluções industriais</p></body></html>"#;
        let text = extract_text(html);
        assert!(text.contains("Empresa Acme"));
        assert!(text.contains("Soluções industriais"));
        assert!(!text.contains("hidden"));
        assert!(!text.contains(".a{}"));
    }

    #[test]
    fn test_extract_text_truncates_runaway_page() {
        let huge = format!("<html><body><p>{}</p></body></html>", "a".repeat(2 * MAX_EXTRACT_BYTES));
        let text = extract_text(&huge);
        assert!(text.len() <= MAX_EXTRACT_BYTES);
        assert!(text.starts_with('a'));
    }

    #[test]
    fn test_extract_text_is_deterministic() {
        let html = big_html("Sobre a empresa");
        assert_eq!(extract_text(&html), extract_text(&html));
    }

    #[test]
    fn test_decode_utf8() {
        let body = "Soluções em aço".as_bytes();
        assert_eq!(decode_body(body, Some("text/html; charset=utf-8")), "Soluções em aço");
    }

    #[test]
    fn test_decode_latin1_header() {
        // "aço" in ISO-8859-1
        let bytes: &[u8] = &[0x61, 0xE7, 0x6F];
        let decoded = decode_body(bytes, Some("text/html; charset=iso-8859-1"));
        assert_eq!(decoded, "aço");
    }

    #[test]
    fn test_decode_meta_charset() {
        let mut bytes = b"<html><head><meta charset=\"iso-8859-1\"></head><body>a\xE7o</body></html>".to_vec();
        let decoded = decode_body(&bytes, None);
        assert!(decoded.contains("aço"));
        // UTF-8 body without any charset hints still decodes
        bytes = "<html><body>aço</body></html>".as_bytes().to_vec();
        assert!(decode_body(&bytes, None).contains("aço"));
    }

    #[test]
    fn test_decode_invalid_utf8_falls_back() {
        let bytes: &[u8] = &[0x61, 0xE7, 0x6F];
        let decoded = decode_body(bytes, None);
        assert_eq!(decoded, "aço");
    }

    #[test]
    fn test_pdf_returns_empty() {
        assert_eq!(decode_body(b"%PDF-1.7 ...", None), "");
        assert_eq!(decode_body(b"anything", Some("application/pdf")), "");
    }

    #[test]
    fn test_soft_404_by_size() {
        assert!(looks_like_soft_404("tiny page"));
    }

    #[test]
    fn test_soft_404_by_signature_pt() {
        let body = big_html("Ops! Página não encontrada");
        assert!(looks_like_soft_404(&body));
    }

    #[test]
    fn test_soft_404_negative() {
        let body = big_html("Catálogo de produtos e serviços da empresa");
        assert!(!looks_like_soft_404(&body));
    }

    #[test]
    fn test_try_extract_matches_extract() {
        let html = big_html("Catálogo de produtos");
        assert_eq!(try_extract_text(&html), Some(extract_text(&html)));
    }

    #[test]
    fn test_body_signature_identity() {
        let a = "same body";
        assert_eq!(body_signature(a), body_signature("same body"));
        assert_ne!(body_signature(a), body_signature("other body"));
    }
}
