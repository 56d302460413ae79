//! Config layer types and the field-by-field deep merge.
//!
//! A [`ConfigLayer`] is a partial document: every field is optional so a
//! layer only states what it knows. [`SiteConfig`] is the fully merged
//! view with defaults filled in.

use super::SiteId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Semantic role a selector candidate list plays on a locator page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SearchInput,
    SubmitButton,
    PaginationControl,
    ResultCard,
    EntryButton,
    PopupDismiss,
    PopupZipInput,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::SearchInput,
        Role::SubmitButton,
        Role::PaginationControl,
        Role::ResultCard,
        Role::EntryButton,
        Role::PopupDismiss,
        Role::PopupZipInput,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SearchInput => "search_input",
            Self::SubmitButton => "submit_button",
            Self::PaginationControl => "pagination_control",
            Self::ResultCard => "result_card",
            Self::EntryButton => "entry_button",
            Self::PopupDismiss => "popup_dismiss",
            Self::PopupZipInput => "popup_zip_input",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a data field's value is read from the matched element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Text,
    #[serde(alias = "href", alias = "attr")]
    Attribute,
}

/// How results beyond the first batch are revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationMode {
    #[default]
    #[serde(alias = "view_more", alias = "load_more")]
    ClickMore,
    VirtualScroll,
    #[serde(alias = "scroll", alias = "infinite_scroll")]
    PlainScroll,
    None,
}

/// How the search is submitted once the input is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStrategy {
    Click,
    Enter,
    /// Click the submit control if one resolves, otherwise press Enter.
    #[default]
    ClickThenEnter,
}

/// Partial extraction rule for one output field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldRuleLayer {
    /// Candidates relative to the card, primary first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ValueKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    /// Regex post-filter; first capture group wins when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Merged extraction rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub selectors: Vec<String>,
    pub kind: ValueKind,
    pub attribute: Option<String>,
    pub pattern: Option<String>,
}

impl FieldRule {
    /// Attribute to read for [`ValueKind::Attribute`] rules.
    pub fn attribute_name(&self) -> &str {
        self.attribute.as_deref().unwrap_or("href")
    }
}

impl From<&FieldRuleLayer> for FieldRule {
    fn from(layer: &FieldRuleLayer) -> Self {
        Self {
            selectors: layer.selectors.clone(),
            kind: layer.kind.unwrap_or_default(),
            attribute: layer.attribute.clone(),
            pattern: layer.pattern.clone(),
        }
    }
}

/// Partial interaction knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_submit_wait_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_load_wait_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_mode: Option<PaginationMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pagination: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_strategy: Option<SubmitStrategy>,
    /// URL with a `{query}` placeholder that skips form interaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_url_template: Option<String>,
}

/// Merged interaction knobs with defaults applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionParams {
    pub post_submit_wait_ms: u64,
    pub page_load_wait_ms: u64,
    pub pagination_mode: PaginationMode,
    pub max_pagination: u32,
    pub pagination_delay_ms: u64,
    pub submit_strategy: SubmitStrategy,
    pub direct_url_template: Option<String>,
}

impl Default for InteractionParams {
    fn default() -> Self {
        Self {
            post_submit_wait_ms: 15_000,
            page_load_wait_ms: 3_000,
            pagination_mode: PaginationMode::ClickMore,
            max_pagination: 30,
            pagination_delay_ms: 1_500,
            submit_strategy: SubmitStrategy::ClickThenEnter,
            direct_url_template: None,
        }
    }
}

impl InteractionParams {
    fn from_layer(layer: &InteractionLayer) -> Self {
        let d = Self::default();
        Self {
            post_submit_wait_ms: layer.post_submit_wait_ms.unwrap_or(d.post_submit_wait_ms),
            page_load_wait_ms: layer.page_load_wait_ms.unwrap_or(d.page_load_wait_ms),
            pagination_mode: layer.pagination_mode.unwrap_or(d.pagination_mode),
            max_pagination: layer.max_pagination.unwrap_or(d.max_pagination),
            pagination_delay_ms: layer.pagination_delay_ms.unwrap_or(d.pagination_delay_ms),
            submit_strategy: layer.submit_strategy.unwrap_or(d.submit_strategy),
            direct_url_template: layer.direct_url_template.clone(),
        }
    }
}

/// One independently loadable partial configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigLayer {
    #[serde(default)]
    pub selectors: BTreeMap<Role, Vec<String>>,
    #[serde(default)]
    pub data_fields: BTreeMap<String, FieldRuleLayer>,
    #[serde(default)]
    pub interaction: InteractionLayer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub already_on_locator: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// How candidate arrays from a higher layer combine with lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayMerge {
    /// Higher-layer entries first, then lower-layer entries not already present.
    Prepend,
    /// Higher-layer entries only.
    Replace,
}

impl ConfigLayer {
    /// Whether this layer carries any selector or field knowledge.
    pub fn is_empty(&self) -> bool {
        self.selectors.values().all(|v| v.is_empty()) && self.data_fields.is_empty()
    }

    pub fn candidates(&self, role: Role) -> &[String] {
        self.selectors.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Overlay `upper` onto `self`, field by field.
    pub fn overlay(&mut self, upper: &ConfigLayer, arrays: ArrayMerge) {
        for (role, list) in &upper.selectors {
            if list.is_empty() {
                continue;
            }
            let slot = self.selectors.entry(*role).or_default();
            *slot = merge_candidates(list, slot, arrays);
        }

        for (name, rule) in &upper.data_fields {
            let slot = self.data_fields.entry(name.clone()).or_default();
            if !rule.selectors.is_empty() {
                slot.selectors = merge_candidates(&rule.selectors, &slot.selectors, arrays);
            }
            replace_if_some(&mut slot.kind, &rule.kind);
            replace_if_some(&mut slot.attribute, &rule.attribute);
            replace_if_some(&mut slot.pattern, &rule.pattern);
        }

        let (ours, theirs) = (&mut self.interaction, &upper.interaction);
        replace_if_some(&mut ours.post_submit_wait_ms, &theirs.post_submit_wait_ms);
        replace_if_some(&mut ours.page_load_wait_ms, &theirs.page_load_wait_ms);
        replace_if_some(&mut ours.pagination_mode, &theirs.pagination_mode);
        replace_if_some(&mut ours.max_pagination, &theirs.max_pagination);
        replace_if_some(&mut ours.pagination_delay_ms, &theirs.pagination_delay_ms);
        replace_if_some(&mut ours.submit_strategy, &theirs.submit_strategy);
        replace_if_some(&mut ours.direct_url_template, &theirs.direct_url_template);

        replace_if_some(&mut self.confidence, &upper.confidence);
        replace_if_some(&mut self.generated_at, &upper.generated_at);
        replace_if_some(&mut self.locator_url, &upper.locator_url);
        replace_if_some(&mut self.already_on_locator, &upper.already_on_locator);
        replace_if_some(&mut self.notes, &upper.notes);
    }

    /// Copy of this layer without selector or field knowledge.
    ///
    /// Used for zero-confidence discovered layers, which keep metadata
    /// (locator URL, timestamps) but must not shadow base selectors.
    pub fn metadata_only(&self) -> ConfigLayer {
        ConfigLayer {
            selectors: BTreeMap::new(),
            data_fields: BTreeMap::new(),
            interaction: InteractionLayer::default(),
            ..self.clone()
        }
    }
}

fn replace_if_some<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if let Some(v) = value {
        *slot = Some(v.clone());
    }
}

fn merge_candidates(upper: &[String], lower: &[String], arrays: ArrayMerge) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(upper.len() + lower.len());
    let tail: &[String] = match arrays {
        ArrayMerge::Prepend => lower,
        ArrayMerge::Replace => &[],
    };
    for candidate in upper.iter().chain(tail) {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() && !out.iter().any(|c| c == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Which layers contributed to a merged view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerPresence {
    pub discovered: bool,
    pub discovered_stale: bool,
    pub manual_override: bool,
}

/// Fully merged configuration for one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub identity: SiteId,
    pub selectors: BTreeMap<Role, Vec<String>>,
    pub data_fields: BTreeMap<String, FieldRule>,
    pub interaction: InteractionParams,
    pub confidence: f32,
    pub freshness: Option<DateTime<Utc>>,
    pub locator_url: Option<String>,
    pub already_on_locator: bool,
    pub layers: LayerPresence,
}

impl SiteConfig {
    /// Deep-merge base < discovered < manual-override.
    pub fn merge(
        identity: SiteId,
        base: &ConfigLayer,
        discovered: Option<&ConfigLayer>,
        manual_override: Option<&ConfigLayer>,
        discovered_stale: bool,
    ) -> Self {
        let mut merged = base.clone();
        merged.confidence = None;
        merged.generated_at = None;

        if let Some(layer) = discovered {
            if layer.confidence.unwrap_or(0.0) > 0.0 {
                merged.overlay(layer, ArrayMerge::Prepend);
            } else {
                merged.overlay(&layer.metadata_only(), ArrayMerge::Prepend);
            }
        }
        if let Some(layer) = manual_override {
            merged.overlay(layer, ArrayMerge::Replace);
        }

        let confidence = match (manual_override.and_then(|o| o.confidence), discovered) {
            (Some(c), _) => c,
            (None, Some(d)) => d.confidence.unwrap_or(0.0),
            (None, None) => 0.0,
        };

        Self {
            identity,
            selectors: merged.selectors,
            data_fields: merged
                .data_fields
                .iter()
                .map(|(name, rule)| (name.clone(), FieldRule::from(rule)))
                .collect(),
            interaction: InteractionParams::from_layer(&merged.interaction),
            confidence: confidence.clamp(0.0, 1.0),
            freshness: discovered.and_then(|d| d.generated_at),
            locator_url: merged.locator_url,
            already_on_locator: merged.already_on_locator.unwrap_or(false),
            layers: LayerPresence {
                discovered: discovered.is_some(),
                discovered_stale,
                manual_override: manual_override.is_some(),
            },
        }
    }

    /// Ordered candidates for a role; empty when no layer names one.
    pub fn candidates(&self, role: Role) -> &[String] {
        self.selectors.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Roles that must resolve to at least one candidate.
    pub fn required_roles(&self) -> Vec<Role> {
        if self.interaction.direct_url_template.is_some() {
            vec![Role::ResultCard]
        } else {
            vec![Role::SearchInput, Role::ResultCard]
        }
    }

    /// First required role with no candidates at any layer.
    pub fn missing_required_role(&self) -> Option<Role> {
        self.required_roles()
            .into_iter()
            .find(|role| self.candidates(*role).is_empty())
    }
}
