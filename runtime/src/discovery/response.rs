//! Typed shapes of model responses and their conversion into config layers.
//!
//! Small models are loose with JSON: a selector list may arrive as a single
//! string, `null`, or an array mixing strings and junk. The deserializers
//! here accept all of those and keep only usable selector strings.

use crate::config::{ConfigLayer, FieldRuleLayer, PaginationMode, Role, SubmitStrategy, ValueKind};
use crate::extraction::Candidate;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// Deserialize `null`, a string, or an array of strings into a list.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

/// Whether a proposed selector is worth keeping.
pub fn usable_selector(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.len() >= 2 && Candidate::parse(trimmed).is_some()
}

fn usable(list: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in list {
        let s = s.trim().to_string();
        if usable_selector(&s) && !out.contains(&s) {
            out.push(s);
        }
    }
    out
}

/// Locator-page choice.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocatorResponse {
    #[serde(default, alias = "url", alias = "dealer_locator_url")]
    pub locator_url: Option<String>,
    #[serde(default, alias = "is_locator_page")]
    pub already_on_locator: bool,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default, alias = "reasoning")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormSelectors {
    #[serde(default, deserialize_with = "string_or_list", alias = "zip_input")]
    pub search_input: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list", alias = "search_button")]
    pub submit_button: Vec<String>,
    #[serde(
        default,
        deserialize_with = "string_or_list",
        alias = "view_more_button",
        alias = "load_more_button"
    )]
    pub pagination_control: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list", alias = "dealer_cards")]
    pub result_card: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub entry_button: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub popup_dismiss: Vec<String>,
}

/// Search-form and result-container proposal.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormResponse {
    #[serde(default)]
    pub selectors: FormSelectors,
    #[serde(default)]
    pub pagination_mode: Option<String>,
    #[serde(default)]
    pub submit_strategy: Option<String>,
    #[serde(default)]
    pub direct_url_template: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl FormResponse {
    /// Convert into a discovered layer. Unusable selectors are dropped; a
    /// proposal left with no selectors gets confidence 0.
    pub fn into_layer(self) -> ConfigLayer {
        let mut layer = ConfigLayer::default();
        let s = self.selectors;
        for (role, list) in [
            (Role::SearchInput, s.search_input),
            (Role::SubmitButton, s.submit_button),
            (Role::PaginationControl, s.pagination_control),
            (Role::ResultCard, s.result_card),
            (Role::EntryButton, s.entry_button),
            (Role::PopupDismiss, s.popup_dismiss),
        ] {
            let list = usable(list);
            if !list.is_empty() {
                layer.selectors.insert(role, list);
            }
        }

        layer.interaction.pagination_mode = self.pagination_mode.as_deref().and_then(parse_pagination);
        layer.interaction.submit_strategy = self.submit_strategy.as_deref().and_then(parse_submit);
        layer.interaction.direct_url_template = self
            .direct_url_template
            .filter(|t| t.contains("{query}") && t.starts_with("http"));

        let confidence = if layer.is_empty() {
            0.0
        } else {
            self.confidence.unwrap_or(0.5).clamp(0.0, 1.0)
        };
        layer.confidence = Some(confidence);
        layer.notes = self.notes;
        layer
    }
}

/// One proposed data-field rule.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldResponse {
    #[serde(default, deserialize_with = "string_or_list", alias = "selectors")]
    pub selector: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub fallback_selectors: Vec<String>,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: Option<String>,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

impl FieldResponse {
    fn into_rule(self) -> Option<FieldRuleLayer> {
        let selectors = usable(self.selector.into_iter().chain(self.fallback_selectors).collect());
        if selectors.is_empty() {
            return None;
        }
        let (kind, attribute) = match self.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("href") | Some("link") => (ValueKind::Attribute, Some("href".to_string())),
            Some("attribute") | Some("attr") => (ValueKind::Attribute, self.attribute),
            _ => (ValueKind::Text, None),
        };
        Some(FieldRuleLayer {
            selectors,
            kind: Some(kind),
            attribute,
            pattern: self.pattern.filter(|p| regex::Regex::new(p).is_ok()),
        })
    }
}

/// Result-card and data-field proposal.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultsResponse {
    #[serde(
        default,
        deserialize_with = "string_or_list",
        alias = "dealer_cards",
        alias = "card_selector"
    )]
    pub result_card: Vec<String>,
    #[serde(default, alias = "fields")]
    pub data_fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ResultsResponse {
    /// Usable card candidates, in proposal order.
    pub fn card_candidates(&self) -> Vec<String> {
        usable(self.result_card.clone())
    }

    /// Usable field rules. Entries that do not parse are skipped.
    pub fn field_rules(&self) -> BTreeMap<String, FieldRuleLayer> {
        self.data_fields
            .iter()
            .filter_map(|(name, value)| {
                let field: FieldResponse = match value {
                    Value::String(s) => FieldResponse {
                        selector: vec![s.clone()],
                        ..Default::default()
                    },
                    other => serde_json::from_value(other.clone()).ok()?,
                };
                field.into_rule().map(|rule| (name.trim().to_ascii_lowercase(), rule))
            })
            .collect()
    }
}

/// Fast page-state check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PageState {
    #[serde(default)]
    pub has_search_input: bool,
    #[serde(default)]
    pub needs_entry_button: bool,
    #[serde(default)]
    pub entry_selector: Option<String>,
    /// Visible label of the entry control, used as a text filter.
    #[serde(default)]
    pub entry_text: Option<String>,
}

pub fn parse_pagination(raw: &str) -> Option<PaginationMode> {
    let normalized = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    if normalized == "pagination" || normalized == "next_page" {
        return Some(PaginationMode::ClickMore);
    }
    serde_json::from_value(Value::String(normalized)).ok()
}

pub fn parse_submit(raw: &str) -> Option<SubmitStrategy> {
    let normalized = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    match normalized.as_str() {
        "enter" | "press_enter" | "keyboard" => Some(SubmitStrategy::Enter),
        "click" | "button" => Some(SubmitStrategy::Click),
        other => serde_json::from_value(Value::String(other.to_string())).ok(),
    }
}
