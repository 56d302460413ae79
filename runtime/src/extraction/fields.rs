//! Per-card field extraction.

use super::candidate::{element_text, resolve_within};
use super::normalize::{clean_name, collapse_whitespace, strip_uri_scheme};
use crate::config::{FieldRule, ValueKind};
use regex::Regex;
use scraper::ElementRef;
use std::collections::BTreeMap;

struct CompiledRule {
    name: String,
    rule: FieldRule,
    /// `Err(())` when the pattern failed to compile; the field stays empty.
    pattern: Option<Result<Regex, ()>>,
}

/// Data-field rules compiled once and applied to many cards.
pub struct FieldExtractor {
    rules: Vec<CompiledRule>,
}

impl FieldExtractor {
    pub fn new(rules: &BTreeMap<String, FieldRule>) -> Self {
        let rules = rules
            .iter()
            .map(|(name, rule)| {
                let pattern = rule.pattern.as_deref().map(|p| {
                    Regex::new(p).map_err(|e| {
                        tracing::warn!("invalid pattern for field `{name}`: {e}");
                    })
                });
                CompiledRule {
                    name: name.clone(),
                    rule: rule.clone(),
                    pattern,
                }
            })
            .collect();
        Self { rules }
    }

    /// Extract every configured field relative to `card`.
    ///
    /// Every rule yields an entry; fields that do not match are empty.
    pub fn extract(&self, card: ElementRef<'_>) -> BTreeMap<String, String> {
        self.rules
            .iter()
            .map(|compiled| (compiled.name.clone(), extract_one(card, compiled)))
            .collect()
    }
}

fn extract_one(card: ElementRef<'_>, compiled: &CompiledRule) -> String {
    let rule = &compiled.rule;
    let Some(resolution) = resolve_within(card, &rule.selectors) else {
        return String::new();
    };

    let raw = resolution
        .elements
        .iter()
        .map(|el| read_value(el, rule))
        .find(|v| !v.is_empty())
        .unwrap_or_default();

    let filtered = match &compiled.pattern {
        None => raw,
        Some(Ok(re)) => apply_pattern(re, &raw),
        Some(Err(())) => String::new(),
    };

    if compiled.name == "name" {
        clean_name(&filtered)
    } else {
        filtered
    }
}

fn read_value(el: &ElementRef<'_>, rule: &FieldRule) -> String {
    match rule.kind {
        ValueKind::Text => element_text(el),
        ValueKind::Attribute => el
            .value()
            .attr(rule.attribute_name())
            .map(|v| strip_uri_scheme(v).to_string())
            .unwrap_or_default(),
    }
}

/// First capture group if the pattern has one, else the whole match.
/// No match yields an empty string.
fn apply_pattern(re: &Regex, value: &str) -> String {
    match re.captures(value) {
        Some(caps) => caps
            .get(1)
            .or_else(|| caps.get(0))
            .map(|m| collapse_whitespace(m.as_str()))
            .unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::{Html, Selector};

    const CARD: &str = r#"
    <div class="card">
        <h3>1. Acme   Motors</h3>
        <p class="addr">1 Main St, New York, NY 10001</p>
        <a class="call" href="tel:+12125550100">Call</a>
        <a class="site" href="">Website</a>
        <a class="site" href="https://acme.example">Website</a>
        <span class="dist">2.4 mi away</span>
    </div>
    "#;

    fn rule(selectors: &[&str], kind: ValueKind, attribute: Option<&str>, pattern: Option<&str>) -> FieldRule {
        FieldRule {
            selectors: selectors.iter().map(|s| s.to_string()).collect(),
            kind,
            attribute: attribute.map(str::to_string),
            pattern: pattern.map(str::to_string),
        }
    }

    fn extract(rules: BTreeMap<String, FieldRule>) -> BTreeMap<String, String> {
        let doc = Html::parse_fragment(CARD);
        let sel = Selector::parse("div.card").unwrap();
        let card = doc.select(&sel).next().unwrap();
        FieldExtractor::new(&rules).extract(card)
    }

    #[test]
    fn test_text_and_attribute_fields() {
        let mut rules = BTreeMap::new();
        rules.insert("name".into(), rule(&["h3"], ValueKind::Text, None, None));
        rules.insert("address".into(), rule(&[".address", ".addr"], ValueKind::Text, None, None));
        rules.insert("phone".into(), rule(&["a.call"], ValueKind::Attribute, Some("href"), None));
        rules.insert("website".into(), rule(&["a.site"], ValueKind::Attribute, None, None));

        let out = extract(rules);
        assert_eq!(out["name"], "Acme Motors");
        assert_eq!(out["address"], "1 Main St, New York, NY 10001");
        assert_eq!(out["phone"], "+12125550100");
        assert_eq!(out["website"], "https://acme.example");
    }

    #[test]
    fn test_regex_filter() {
        let mut rules = BTreeMap::new();
        rules.insert(
            "distance".into(),
            rule(&[".dist"], ValueKind::Text, None, Some(r"([\d.]+)\s*mi")),
        );
        rules.insert(
            "zip".into(),
            rule(&[".addr"], ValueKind::Text, None, Some(r"\b\d{5}\b")),
        );
        let out = extract(rules);
        assert_eq!(out["distance"], "2.4");
        assert_eq!(out["zip"], "10001");
    }

    #[test]
    fn test_regex_miss_and_invalid_regex_yield_empty() {
        let mut rules = BTreeMap::new();
        rules.insert("miss".into(), rule(&["h3"], ValueKind::Text, None, Some(r"\d{9}")));
        rules.insert("broken".into(), rule(&["h3"], ValueKind::Text, None, Some(r"(unclosed")));
        rules.insert("absent".into(), rule(&[".nothing"], ValueKind::Text, None, None));
        let out = extract(rules);
        assert_eq!(out["miss"], "");
        assert_eq!(out["broken"], "");
        assert_eq!(out["absent"], "");
        assert_eq!(out.len(), 3);
    }
}
