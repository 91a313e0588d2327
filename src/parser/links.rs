//! Internal-link extraction and prioritisation
//!
//! Parses anchors out of a page, keeps only same-registrable-domain
//! HTML links, and ranks them by a keyword heuristic so the subpage
//! budget goes to About / Products / Services / Contact style pages.

use std::collections::HashSet;

use scraper::{Html, Selector};
use url::Url;

use crate::scraper::url::{normalize_page_url, path_depth, registrable_domain};

/// Extensions that are never HTML pages.
const EXCLUDED_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".ppt", ".pptx", ".xls", ".xlsx", ".csv", ".txt", ".xml", ".json",
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".ico", ".bmp", ".avif",
    ".zip", ".rar", ".tar", ".gz", ".7z",
    ".mp4", ".mp3", ".avi", ".mov", ".webm",
    ".js", ".css", ".woff", ".woff2", ".ttf", ".eot",
];

/// Social networks and aggregators: links to these hosts are noise even
/// when a site proxies them through its own domain path.
const SOCIAL_HOSTS: &[&str] = &[
    "facebook.com", "instagram.com", "linkedin.com", "twitter.com", "x.com", "youtube.com",
    "wa.me", "api.whatsapp.com", "t.me", "pinterest.com", "tiktok.com", "goo.gl", "maps.google.com",
];

/// High-value keywords, Portuguese first. A hit pushes a link to the
/// front of the selection.
const HIGH_PRIORITY_KEYWORDS: &[&str] = &[
    "quem-somos", "sobre", "empresa", "institucional", "about",
    "produto", "produtos", "products", "servico", "servicos", "services",
    "portfolio", "clientes", "cases", "atuacao", "solucoes",
    "contato", "contact", "fale-conosco", "unidades",
];

/// Low-value keywords: carts, auth, legal boilerplate, feeds.
const LOW_PRIORITY_KEYWORDS: &[&str] = &[
    "login", "signin", "cadastro", "cart", "carrinho", "checkout",
    "politica", "privacidade", "policy", "termos", "terms", "cookies",
    "blog", "noticia", "news", "feed", "rss", "sitemap", "wp-json",
];

const MAX_LINK_DEPTH: usize = 3;

/// Outcome of running a page through extraction and selection.
#[derive(Debug, Clone, Default)]
pub struct LinkSelection {
    /// Raw anchor count found in the HTML
    pub seen: u64,
    /// Links that survived filtering
    pub filtered: Vec<String>,
    /// Prioritised prefix actually scheduled for fetching
    pub selected: Vec<String>,
}

/// Extract every same-domain internal link from a page, in document
/// order, deduplicated. Anchors, query-only variants of the base page
/// and cross-domain links are dropped here; extension and keyword
/// filtering happens in [`filter_links`].
pub fn extract_links(html: &str, base: &Url) -> (u64, Vec<String>) {
    let document = Html::parse_document(html);
    let anchor = Selector::parse("a[href]").unwrap();
    let base_domain = registrable_domain(base);

    let mut seen = 0u64;
    let mut dedup = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(&anchor) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        seen += 1;

        let href = href.trim();
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("javascript:")
        {
            continue;
        }

        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        if registrable_domain(&resolved) != base_domain {
            continue;
        }

        let normalized = normalize_page_url(&resolved);
        if normalized == normalize_page_url(base) {
            continue;
        }
        if dedup.insert(normalized.clone()) {
            links.push(normalized);
        }
    }

    (seen, links)
}

/// Drop non-HTML targets, social hosts and over-deep paths.
pub fn filter_links(links: Vec<String>) -> Vec<String> {
    links
        .into_iter()
        .filter(|link| {
            let Ok(url) = Url::parse(link) else {
                return false;
            };
            let path = url.path().to_ascii_lowercase();
            if EXCLUDED_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
                return false;
            }
            let lower = link.to_ascii_lowercase();
            if SOCIAL_HOSTS.iter().any(|h| lower.contains(h)) {
                return false;
            }
            path_depth(&url) <= MAX_LINK_DEPTH
        })
        .collect()
}

/// Keyword score for one link. Positive for profile-relevant pages,
/// strongly negative for auth/legal/feed pages, slight penalty per path
/// segment so shallower pages win ties.
fn score(link: &str) -> i32 {
    let lower = link.to_ascii_lowercase();
    let mut score = 0i32;

    if HIGH_PRIORITY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 50;
    }
    if LOW_PRIORITY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score -= 100;
    }
    if let Ok(url) = Url::parse(link) {
        score -= path_depth(&url) as i32;
    }
    score
}

/// Sort links by descending score. The tie-break is total (score, then
/// path length, then the URL itself) so a shuffled input always yields
/// the same selected prefix.
pub fn prioritize(mut links: Vec<String>) -> Vec<String> {
    links.sort_by(|a, b| {
        score(b)
            .cmp(&score(a))
            .then_with(|| a.len().cmp(&b.len()))
            .then_with(|| a.cmp(b))
    });
    links.retain(|l| score(l) > -80);
    links
}

/// Full pipeline: extract, filter, prioritise, cap at `max_subpages`.
pub fn select_subpages(html: &str, base: &Url, max_subpages: usize) -> LinkSelection {
    let (seen, raw) = extract_links(html, base);
    let filtered = filter_links(raw);
    let prioritized = prioritize(filtered.clone());
    let selected = prioritized.into_iter().take(max_subpages).collect();
    LinkSelection {
        seen,
        filtered,
        selected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://acme.com.br/").unwrap()
    }

    const PAGE: &str = r##"<html><body>
        <a href="/sobre">Sobre</a>
        <a href="/produtos">Produtos</a>
        <a href="/contato">Contato</a>
        <a href="/blog/post-1">Blog</a>
        <a href="/politica-privacidade">Privacidade</a>
        <a href="https://facebook.com/acme">Facebook</a>
        <a href="https://outra-empresa.com.br/x">Externo</a>
        <a href="/catalogo.pdf">Catálogo</a>
        <a href="/logo.png">Logo</a>
        <a href="#top">Topo</a>
        <a href="mailto:contato@acme.com.br">Email</a>
        <a href="/a/b/c/d/e">Fundo</a>
        <a href="/sobre">Sobre de novo</a>
    </body></html>"##;

    #[test]
    fn test_extract_keeps_same_domain_only() {
        let (seen, links) = extract_links(PAGE, &base());
        assert_eq!(seen, 13);
        assert!(links.iter().all(|l| l.contains("acme.com.br")));
        assert!(!links.iter().any(|l| l.contains("facebook")));
        assert!(!links.iter().any(|l| l.contains("outra-empresa")));
    }

    #[test]
    fn test_extract_deduplicates_preserving_order() {
        let (_, links) = extract_links(PAGE, &base());
        let sobre_count = links.iter().filter(|l| l.ends_with("/sobre")).count();
        assert_eq!(sobre_count, 1);
        assert_eq!(links[0], "https://acme.com.br/sobre");
    }

    #[test]
    fn test_extract_is_order_stable() {
        let first = extract_links(PAGE, &base());
        let second = extract_links(PAGE, &base());
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn test_filter_drops_assets_and_depth() {
        let (_, links) = extract_links(PAGE, &base());
        let filtered = filter_links(links);
        assert!(!filtered.iter().any(|l| l.ends_with(".pdf")));
        assert!(!filtered.iter().any(|l| l.ends_with(".png")));
        assert!(!filtered.iter().any(|l| l.contains("/a/b/c/d")));
    }

    #[test]
    fn test_prioritize_prefers_profile_pages() {
        let selection = select_subpages(PAGE, &base(), 3);
        assert_eq!(selection.selected.len(), 3);
        assert!(selection.selected.iter().any(|l| l.ends_with("/sobre")));
        assert!(selection.selected.iter().any(|l| l.ends_with("/produtos")));
        assert!(selection.selected.iter().any(|l| l.ends_with("/contato")));
        assert!(!selection.selected.iter().any(|l| l.contains("privacidade")));
    }

    #[test]
    fn test_prioritize_total_order_under_shuffle() {
        let links = vec![
            "https://acme.com.br/contato".to_string(),
            "https://acme.com.br/sobre".to_string(),
            "https://acme.com.br/produtos".to_string(),
            "https://acme.com.br/x".to_string(),
        ];
        let mut shuffled = links.clone();
        shuffled.reverse();
        assert_eq!(prioritize(links), prioritize(shuffled));
    }

    #[test]
    fn test_low_priority_pages_dropped_below_floor() {
        let links = vec!["https://acme.com.br/login".to_string()];
        assert!(prioritize(links).is_empty());
    }

    #[test]
    fn test_select_caps_at_max() {
        let selection = select_subpages(PAGE, &base(), 2);
        assert_eq!(selection.selected.len(), 2);
    }

    #[test]
    fn test_max_subpages_zero_selects_nothing() {
        let selection = select_subpages(PAGE, &base(), 0);
        assert!(selection.selected.is_empty());
        assert!(selection.seen > 0);
    }
}
