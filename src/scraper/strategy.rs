//! Strategy selection
//!
//! A pure function from the analyzed site profile to an ordered
//! fallback list of fetch strategies. The orchestrator walks the list
//! until one works; it also remembers the winner per domain for the
//! process lifetime.

use crate::models::{Protection, SiteKind, SiteProfile, Strategy};

/// Ordered fallback list for a site profile.
pub fn select(profile: &SiteProfile) -> Vec<Strategy> {
    match profile.protection {
        Protection::Cloudflare => vec![Strategy::Aggressive, Strategy::Robust],
        Protection::Waf | Protection::Captcha => vec![Strategy::Aggressive],
        Protection::RateLimit => vec![Strategy::Robust],
        Protection::Unknown => vec![Strategy::Aggressive, Strategy::Robust],
        Protection::None => match profile.kind {
            SiteKind::Static => vec![Strategy::Fast, Strategy::Standard],
            SiteKind::Spa => vec![Strategy::Standard, Strategy::Robust],
            SiteKind::Hybrid => vec![Strategy::Standard, Strategy::Robust],
        },
    }
}

/// WAF and captcha sites rarely yield to retries; the orchestrator
/// treats them as likely terminal after the single aggressive pass.
pub fn likely_terminal(profile: &SiteProfile) -> bool {
    matches!(profile.protection, Protection::Waf | Protection::Captcha)
}

/// Whether the profile demands the slow-domain flag before any fetch.
pub fn enforce_slow(profile: &SiteProfile) -> bool {
    profile.protection == Protection::RateLimit
}

/// Strategies that use the longer per-request deadline tier.
pub fn is_slow_tier(strategy: Strategy) -> bool {
    matches!(strategy, Strategy::Robust | Strategy::Aggressive)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(protection: Protection, kind: SiteKind) -> SiteProfile {
        SiteProfile {
            reachable: true,
            protection,
            kind,
            latency_ms: 100,
            canonical_url: "https://acme.com.br".into(),
            cached_html: None,
        }
    }

    #[test]
    fn test_clean_static() {
        assert_eq!(
            select(&profile(Protection::None, SiteKind::Static)),
            vec![Strategy::Fast, Strategy::Standard]
        );
    }

    #[test]
    fn test_clean_spa() {
        assert_eq!(
            select(&profile(Protection::None, SiteKind::Spa)),
            vec![Strategy::Standard, Strategy::Robust]
        );
    }

    #[test]
    fn test_cloudflare() {
        assert_eq!(
            select(&profile(Protection::Cloudflare, SiteKind::Static)),
            vec![Strategy::Aggressive, Strategy::Robust]
        );
    }

    #[test]
    fn test_waf_is_terminal_single_strategy() {
        let p = profile(Protection::Waf, SiteKind::Static);
        assert_eq!(select(&p), vec![Strategy::Aggressive]);
        assert!(likely_terminal(&p));

        let c = profile(Protection::Captcha, SiteKind::Static);
        assert_eq!(select(&c), vec![Strategy::Aggressive]);
        assert!(likely_terminal(&c));
    }

    #[test]
    fn test_rate_limit_enforces_slow() {
        let p = profile(Protection::RateLimit, SiteKind::Static);
        assert_eq!(select(&p), vec![Strategy::Robust]);
        assert!(enforce_slow(&p));
        assert!(!likely_terminal(&p));
    }

    #[test]
    fn test_slow_tier_mapping() {
        assert!(!is_slow_tier(Strategy::Fast));
        assert!(!is_slow_tier(Strategy::Standard));
        assert!(is_slow_tier(Strategy::Robust));
        assert!(is_slow_tier(Strategy::Aggressive));
    }
}
