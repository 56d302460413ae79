//! Homepage link scoring for locator-page candidates.
//!
//! Links are scored on their path and anchor text. Only internal links
//! survive, deduplicated by path, positive scores only, best first.

use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::OnceLock;
use url::Url;

/// Links handed to inference.
pub const MAX_CANDIDATES: usize = 15;

/// A score at which a URL alone strongly suggests a locator page.
pub const STRONG_SCORE: i32 = 10;

const LOCATOR_KEYWORDS: &[&str] = &[
    "dealer",
    "locator",
    "locate",
    "store",
    "location",
    "retailer",
    "find",
    "near",
    "where-to-buy",
    "showroom",
    "branch",
];

const NEGATIVE_KEYWORDS: &[&str] = &[
    "login",
    "signin",
    "sign-in",
    "cart",
    "checkout",
    "account",
    "career",
    "jobs",
    "privacy",
    "terms",
    "cookie",
    "blog",
    "news",
    "press",
    "investor",
    "legal",
];

fn high_value_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"/dealers?(/|$)",
            r"/find-a-dealer",
            r"/find-dealer",
            r"/dealer-locator",
            r"/locate-dealer",
            r"/dealerships?",
            r"/locations?(/|$)",
            r"/store-locator",
            r"/find-a-store",
            r"/retailers?(/|$)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("locator path regex is valid"))
        .collect()
    })
}

/// A scored internal link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredLink {
    pub url: String,
    pub text: String,
    pub score: i32,
}

/// Score a URL (and its anchor text) as a locator-page candidate.
pub fn score_link(url: &str, text: &str) -> i32 {
    let Ok(parsed) = Url::parse(url) else {
        return 0;
    };
    let path = parsed.path().to_ascii_lowercase();
    let text = text.to_ascii_lowercase();
    let mut score = 0;

    for re in high_value_patterns() {
        if re.is_match(&path) {
            score += 10;
        }
    }
    for kw in LOCATOR_KEYWORDS {
        if path.contains(kw) {
            score += 3;
        }
        if text.contains(&kw.replace('-', " ")) {
            score += 3;
        }
    }
    for kw in NEGATIVE_KEYWORDS {
        if path.contains(kw) {
            score -= 5;
        }
    }

    let depth = path.split('/').filter(|s| !s.is_empty()).count();
    if depth <= 2 {
        score += 2;
    } else if depth > 4 {
        score -= 2;
    }
    if parsed.fragment().is_some() || url.contains('#') {
        score -= 3;
    }
    if parsed.query().is_some() {
        score -= 1;
    }
    score
}

/// Extract, score and rank internal links from a homepage.
pub fn candidate_links(html: &str, base_url: &str, limit: usize) -> Vec<ScoredLink> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let base_host = base.host_str().map(strip_www).unwrap_or_default();
    let doc = Html::parse_document(html);
    let Ok(anchor) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut seen_paths = HashSet::new();
    let mut links: Vec<ScoredLink> = Vec::new();
    for el in doc.select(&anchor) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty()
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
        {
            continue;
        }
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            continue;
        }
        let host = resolved.host_str().map(strip_www).unwrap_or_default();
        if host != base_host {
            continue;
        }
        let path_key = resolved.path().trim_end_matches('/').to_ascii_lowercase();
        if path_key.is_empty() || !seen_paths.insert(path_key) {
            continue;
        }

        let text = el.text().collect::<Vec<_>>().join(" ");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let url = resolved.to_string();
        let score = score_link(&url, &text);
        if score > 0 {
            links.push(ScoredLink { url, text, score });
        }
    }

    links.sort_by(|a, b| b.score.cmp(&a.score));
    links.truncate(limit);
    links
}

/// Whether page text carries both a postal-code prompt and a
/// location-listing signal.
pub fn has_locator_signals(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    let zip = ["zip", "postal", "postcode", "city or state", "enter your location"]
        .iter()
        .any(|s| lower.contains(s));
    let listing = ["dealer", "store", "location", "retailer", "showroom"]
        .iter()
        .any(|s| lower.contains(s));
    zip && listing
}

/// Heuristic confidence for a scored link.
pub fn heuristic_confidence(score: i32) -> f32 {
    (score.max(0) as f32 / 20.0).min(0.9)
}

/// Compare URLs ignoring scheme, `www.`, trailing slash and fragment.
pub fn same_page(a: &str, b: &str) -> bool {
    fn norm(u: &str) -> String {
        match Url::parse(u.trim()) {
            Ok(p) => format!(
                "{}{}{}",
                p.host_str().map(strip_www).unwrap_or_default(),
                p.path().trim_end_matches('/'),
                p.query().map(|q| format!("?{q}")).unwrap_or_default()
            )
            .to_ascii_lowercase(),
            Err(_) => u.trim().trim_end_matches('/').to_ascii_lowercase(),
        }
    }
    norm(a) == norm(b)
}

fn strip_www(host: &str) -> String {
    host.trim_start_matches("www.").to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_prefers_locator_paths() {
        let dealer = score_link("https://acme.com/find-a-dealer", "Find a Dealer");
        let about = score_link("https://acme.com/about", "About us");
        let careers = score_link("https://acme.com/careers/dealer-jobs", "Careers");
        assert!(dealer >= STRONG_SCORE, "{dealer}");
        assert!(dealer > about);
        assert!(careers < dealer);
    }

    #[test]
    fn test_score_penalties() {
        let plain = score_link("https://acme.com/dealers", "");
        assert!(score_link("https://acme.com/dealers#map", "") < plain);
        assert!(score_link("https://acme.com/dealers?x=1", "") < plain);
        assert!(score_link("https://acme.com/a/b/c/d/dealers", "") < plain);
    }

    #[test]
    fn test_candidate_links_internal_deduped_sorted() {
        let html = r#"
        <nav>
            <a href="/about">About</a>
            <a href="/dealers/">Dealers</a>
            <a href="https://www.acme.com/dealers">Dealers again</a>
            <a href="https://other.com/dealers">Partner dealers</a>
            <a href="/store-locator">Store Locator</a>
            <a href="javascript:void(0)">Menu</a>
            <a href="/login">Sign in</a>
        </nav>"#;
        let links = candidate_links(html, "https://www.acme.com/", MAX_CANDIDATES);
        let urls: Vec<_> = links.iter().map(|l| l.url.as_str()).collect();
        assert!(urls.contains(&"https://www.acme.com/dealers/"));
        assert!(urls.contains(&"https://www.acme.com/store-locator"));
        assert!(!urls.iter().any(|u| u.contains("other.com")));
        assert!(!urls.iter().any(|u| u.contains("login")));
        assert_eq!(urls.iter().filter(|u| u.contains("/dealers")).count(), 1);
        assert!(links.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_locator_signals_and_same_page() {
        assert!(has_locator_signals("Enter your ZIP code to find a dealer"));
        assert!(!has_locator_signals("Our story"));
        assert!(same_page("https://www.acme.com/", "http://acme.com"));
        assert!(!same_page("https://acme.com/", "https://acme.com/dealers"));
        assert!((heuristic_confidence(40) - 0.9).abs() < f32::EPSILON);
        assert!((heuristic_confidence(10) - 0.5).abs() < f32::EPSILON);
    }
}
