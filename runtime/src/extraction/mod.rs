//! Selector/field extraction over parsed documents.
//!
//! All public entry points are synchronous and CPU-bound. Async callers
//! run them through `tokio::task::spawn_blocking` when the document is
//! large.

pub mod candidate;
pub mod fields;
pub mod normalize;

pub use candidate::{resolve, resolve_target, resolve_within, Candidate, Resolution, Target};
pub use fields::FieldExtractor;

use crate::config::{Role, SiteConfig};
use crate::records::{RecordFlag, ResultRecord};
use scraper::Html;
use std::collections::HashSet;

/// Where the records of one extraction come from.
#[derive(Debug, Clone)]
pub struct RecordContext {
    pub site: String,
    pub source_url: String,
    pub query: String,
    pub flag: RecordFlag,
}

/// Output of one extraction pass.
#[derive(Debug, Default)]
pub struct Extraction {
    pub records: Vec<ResultRecord>,
    /// Cards matched by the winning result-card candidate.
    pub cards: usize,
    /// Cards that produced no field value at all.
    pub empty_cards: usize,
    /// The result-card candidate that matched.
    pub card_selector: Option<String>,
}

/// Extract one record per result card in `html`.
///
/// Cards with no matching field still yield a record with empty values.
pub fn extract_records(html: &str, config: &SiteConfig, ctx: &RecordContext) -> Extraction {
    extract_snapshots(std::slice::from_ref(&html.to_string()), config, ctx)
}

/// Extract across several DOM snapshots of the same results list.
///
/// Virtualised lists remove cards as they scroll out of view, so every
/// snapshot is parsed; a non-empty card seen in an earlier snapshot is not
/// emitted twice.
pub fn extract_snapshots(
    snapshots: &[String],
    config: &SiteConfig,
    ctx: &RecordContext,
) -> Extraction {
    let extractor = FieldExtractor::new(&config.data_fields);
    let card_candidates = config.candidates(Role::ResultCard);
    let mut out = Extraction::default();
    let mut seen: HashSet<Vec<(String, String)>> = HashSet::new();

    for html in snapshots {
        let doc = Html::parse_document(html);
        let Some(resolution) = resolve(&doc, card_candidates) else {
            continue;
        };
        if out.card_selector.is_none() {
            out.card_selector = Some(resolution.candidate.raw().to_string());
        }

        for card in &resolution.elements {
            let fields = extractor.extract(*card);
            let empty = fields.values().all(|v| v.is_empty());
            if !empty && snapshots.len() > 1 {
                let signature: Vec<(String, String)> = fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if !seen.insert(signature) {
                    continue;
                }
            }

            if empty {
                out.empty_cards += 1;
            }
            out.records.push(ResultRecord::new(
                ctx.site.clone(),
                ctx.source_url.clone(),
                ctx.query.clone(),
                out.cards,
                ctx.flag,
                fields,
            ));
            out.cards += 1;
        }
    }

    if out.empty_cards > 0 {
        tracing::warn!(
            site = %ctx.site,
            query = %ctx.query,
            "{} of {} card(s) matched no data field",
            out.empty_cards,
            out.cards
        );
    }
    out
}

/// Count result cards in `html` using the configured candidates.
pub fn count_cards(html: &str, config: &SiteConfig) -> usize {
    resolve_target(html, config.candidates(Role::ResultCard))
        .map(|t| t.count)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{store::embedded_base, SiteId};

    fn config() -> SiteConfig {
        let base = embedded_base().unwrap();
        SiteConfig::merge(SiteId::new("example.com"), &base, None, None, false)
    }

    fn ctx() -> RecordContext {
        RecordContext {
            site: "example.com".into(),
            source_url: "https://example.com/dealers".into(),
            query: "10001".into(),
            flag: RecordFlag::Unvalidated,
        }
    }

    const RESULTS: &str = r#"
    <html><body><ul>
        <li class="dealer-item">
            <h3>Acme Motors</h3>
            <div class="dealer-address">1 Main St, New York, NY 10001</div>
            <a href="tel:2125550100">Call</a>
            <span class="distance">1.2 mi</span>
        </li>
        <li class="dealer-item">
            <h3>Bolt Cars</h3>
            <div class="dealer-address">9 Broad St, New York, NY 10004</div>
        </li>
        <li class="dealer-item"><img src="x.png"/></li>
    </ul></body></html>
    "#;

    #[test]
    fn test_extract_with_base_config() {
        let out = extract_records(RESULTS, &config(), &ctx());
        assert_eq!(out.cards, 3);
        assert_eq!(out.records.len(), 3);
        assert_eq!(out.empty_cards, 1);
        assert_eq!(out.card_selector.as_deref(), Some("li[class*='dealer' i]"));

        let first = &out.records[0];
        assert_eq!(first.field("name"), "Acme Motors");
        assert_eq!(first.field("address"), "1 Main St, New York, NY 10001");
        assert_eq!(first.field("phone"), "2125550100");
        assert_eq!(first.field("distance"), "1.2");
        assert_eq!(first.query_key_used(), "10001");
        assert!(out.records[2].is_empty());
    }

    #[test]
    fn test_no_cards_is_empty_extraction() {
        let out = extract_records("<html><body><p>No results</p></body></html>", &config(), &ctx());
        assert_eq!(out.cards, 0);
        assert!(out.records.is_empty());
        assert!(out.card_selector.is_none());
    }

    #[test]
    fn test_snapshots_skip_repeated_cards() {
        let page1 = r#"<ul><li class="dealer-a"><h3>A</h3></li><li class="dealer-a"><h3>B</h3></li></ul>"#;
        let page2 = r#"<ul><li class="dealer-a"><h3>B</h3></li><li class="dealer-a"><h3>C</h3></li></ul>"#;
        let out = extract_snapshots(&[page1.to_string(), page2.to_string()], &config(), &ctx());
        let names: Vec<_> = out.records.iter().map(|r| r.field("name").to_string()).collect();
        assert_eq!(names, ["A", "B", "C"]);
    }

    #[test]
    fn test_count_cards() {
        assert_eq!(count_cards(RESULTS, &config()), 3);
        assert_eq!(count_cards("<p></p>", &config()), 0);
    }
}
