//! Post-execution validation.
//!
//! The first unit of a site that submits a search validates the outcome
//! on behalf of every other unit. Validation decides how records are
//! flagged; it never blocks other units from running.

use crate::config::{ConfigLayer, Role, SiteConfig, SiteId};
use crate::discovery::{DiscoveryEngine, ResultsMode};
use crate::error::HarvestResult;
use crate::extraction::{extract_records, resolve_target, RecordContext};
use crate::interaction::InteractionOutcome;
use crate::records::RecordFlag;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};

/// Per-site validation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    InFlight,
    Passed,
    Degraded,
    Disabled,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Passed => "passed",
            Self::Degraded => "degraded",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub passed: bool,
    pub observed_card_count: usize,
    pub reason: String,
    /// Layer committed by a refinement, if any.
    pub refined_layer: Option<ConfigLayer>,
}

/// Shared by all workers of one site.
#[derive(Debug)]
pub struct SiteValidator {
    status: Mutex<ValidationStatus>,
}

impl SiteValidator {
    pub fn new(enabled: bool) -> Self {
        let status = if enabled {
            ValidationStatus::Pending
        } else {
            ValidationStatus::Disabled
        };
        Self {
            status: Mutex::new(status),
        }
    }

    pub fn status(&self) -> ValidationStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the validation run. Only one caller ever gets `true` until
    /// [`release`](Self::release) hands the claim back.
    pub fn try_claim(&self) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status == ValidationStatus::Pending {
            *status = ValidationStatus::InFlight;
            true
        } else {
            false
        }
    }

    /// Give an unused claim back, e.g. when the unit never submitted.
    pub fn release(&self) {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status == ValidationStatus::InFlight {
            *status = ValidationStatus::Pending;
        }
    }

    pub fn finish(&self, outcome: &ValidationOutcome) -> ValidationStatus {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        *status = if outcome.passed {
            ValidationStatus::Passed
        } else {
            ValidationStatus::Degraded
        };
        *status
    }

    /// Flag for records captured now.
    pub fn flag(&self) -> RecordFlag {
        match self.status() {
            ValidationStatus::Passed => RecordFlag::Validated,
            ValidationStatus::Degraded => RecordFlag::Degraded,
            ValidationStatus::Pending | ValidationStatus::InFlight | ValidationStatus::Disabled => {
                RecordFlag::Unvalidated
            }
        }
    }
}

/// Validate the first search outcome of a site.
///
/// Zero cards after a submitted search triggers exactly one alternate
/// results discovery. Cards on the page trigger one initial results
/// discovery to learn field selectors, unless a fresh discovered layer or
/// an override already supplies them and some card carried a value. Only
/// store failures are errors.
pub async fn validate(
    engine: &DiscoveryEngine,
    config: &SiteConfig,
    outcome: &InteractionOutcome,
) -> HarvestResult<ValidationOutcome> {
    let site = &config.identity;
    let html = outcome.final_html();

    if outcome.cards > 0 {
        let extraction = extract_records(
            html,
            config,
            &RecordContext {
                site: site.to_string(),
                source_url: outcome.final_url.clone(),
                query: String::new(),
                flag: RecordFlag::Unvalidated,
            },
        );
        let all_empty = extraction.cards > 0 && extraction.empty_cards == extraction.cards;
        if !all_empty && fields_known(engine, site)? {
            return Ok(ValidationOutcome {
                passed: true,
                observed_card_count: outcome.cards,
                reason: format!("{} result card(s) found", outcome.cards),
                refined_layer: None,
            });
        }

        tracing::info!(site = %site, cards = outcome.cards, all_empty, "learning field selectors");
        let matched: Vec<String> = resolve_target(html, config.candidates(Role::ResultCard))
            .map(|target| vec![target.raw])
            .unwrap_or_default();
        let refined = engine
            .discover_results(site, &outcome.final_url, html, ResultsMode::Initial { matched: &matched })
            .await?;
        let reason = match (&refined.committed, all_empty) {
            (Some(_), _) => format!("{} card(s) found, field selectors refined", outcome.cards),
            (None, true) => format!("{} card(s) found, fields still empty", outcome.cards),
            (None, false) => format!("{} result card(s) found", outcome.cards),
        };
        return Ok(ValidationOutcome {
            passed: true,
            observed_card_count: outcome.cards,
            reason,
            refined_layer: refined.committed,
        });
    }

    if !outcome.submitted {
        return Ok(ValidationOutcome {
            passed: false,
            observed_card_count: 0,
            reason: "search was not submitted".to_string(),
            refined_layer: None,
        });
    }

    let failed = config.candidates(Role::ResultCard).to_vec();
    tracing::info!(site = %site, "no result cards, rediscovering card selector");
    let refined = engine
        .discover_results(site, &outcome.final_url, html, ResultsMode::Alternate { failed: &failed })
        .await?;

    let observed = refined
        .card_selector
        .as_ref()
        .and_then(|s| resolve_target(html, std::slice::from_ref(s)))
        .map(|t| t.count)
        .unwrap_or(0);
    match (refined.committed, refined.card_selector) {
        (Some(layer), Some(selector)) if observed > 0 => Ok(ValidationOutcome {
            passed: true,
            observed_card_count: observed,
            reason: format!("alternate card selector `{selector}` matched {observed} card(s)"),
            refined_layer: Some(layer),
        }),
        _ => {
            let reason = match refined.error {
                Some(e) => format!("no result cards; rediscovery failed: {e}"),
                None => "no result cards; no alternate card selector matched".to_string(),
            };
            Ok(ValidationOutcome {
                passed: false,
                observed_card_count: 0,
                reason,
                refined_layer: None,
            })
        }
    }
}

/// Whether field selectors were already learned or written by hand.
fn fields_known(engine: &DiscoveryEngine, site: &SiteId) -> HarvestResult<bool> {
    let store = engine.store();
    if store
        .manual_override(site)?
        .is_some_and(|layer| !layer.data_fields.is_empty())
    {
        return Ok(true);
    }
    Ok(store.discovered(site)?.is_some_and(|layer| {
        store.is_fresh(&layer) && layer.confidence.unwrap_or(0.0) > 0.0 && !layer.data_fields.is_empty()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, FieldRuleLayer};
    use crate::inference::InferenceTask;
    use crate::testing::{MockFetcher, MockInference};
    use std::sync::Arc;

    const EMPTY: &str = r#"<div class="results"><p>Searching...</p></div>"#;
    const ROWS: &str = r#"<div class="results">
        <div class="dealer-row"><b class="n">North Tractor</b><span class="p">555-0100</span></div>
        <div class="dealer-row"><b class="n">South Tractor</b><span class="p">555-0101</span></div>
    </div>"#;

    fn setup(dir: &tempfile::TempDir, inference: MockInference) -> (DiscoveryEngine, SiteConfig) {
        let store = Arc::new(ConfigStore::open(dir.path().to_path_buf()).unwrap());
        let config = store.get_merged(&SiteId::new("acme.com")).unwrap();
        let engine = DiscoveryEngine::new(Arc::new(inference), Arc::new(MockFetcher::new()), store);
        (engine, config)
    }

    fn outcome(html: &str, cards: usize, submitted: bool) -> InteractionOutcome {
        InteractionOutcome {
            final_url: "https://acme.com/dealers".into(),
            snapshots: vec![html.to_string()],
            submitted,
            cards,
            timed_out: cards == 0,
            waited_ms: 0,
            gate: None,
            popup: None,
            pagination: None,
        }
    }

    #[test]
    fn test_claim_is_exclusive() {
        let validator = SiteValidator::new(true);
        assert_eq!(validator.flag(), RecordFlag::Unvalidated);
        assert!(validator.try_claim());
        assert!(!validator.try_claim());
        validator.release();
        assert!(validator.try_claim());

        let status = validator.finish(&ValidationOutcome {
            passed: false,
            observed_card_count: 0,
            reason: String::new(),
            refined_layer: None,
        });
        assert_eq!(status, ValidationStatus::Degraded);
        assert_eq!(validator.flag(), RecordFlag::Degraded);
        assert!(!validator.try_claim());
    }

    #[test]
    fn test_disabled_never_claims() {
        let validator = SiteValidator::new(false);
        assert!(!validator.try_claim());
        assert_eq!(validator.flag(), RecordFlag::Unvalidated);
    }

    #[tokio::test]
    async fn test_learned_fields_pass_without_inference() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new();
        let (engine, _) = setup(&dir, inference.clone());
        let mut learned = ConfigLayer {
            confidence: Some(0.8),
            ..Default::default()
        };
        learned.data_fields.insert(
            "name".into(),
            FieldRuleLayer {
                selectors: vec!["h3.name".into()],
                ..Default::default()
            },
        );
        let site = SiteId::new("acme.com");
        engine.store().put_discovered(&site, learned).await.unwrap();
        let config = engine.store().get_merged(&site).unwrap();

        let html = r#"<ul><li class="dealer"><h3 class="name">North</h3></li></ul>"#;
        let result = validate(&engine, &config, &outcome(html, 1, true)).await.unwrap();
        assert!(result.passed);
        assert_eq!(result.observed_card_count, 1);
        assert!(result.refined_layer.is_none());
        assert!(inference.requests().is_empty());
    }

    #[tokio::test]
    async fn test_partially_matching_cards_learn_fields_once() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new().respond(
            InferenceTask::ResultSelectors,
            r#"{"data_fields": {"address": ".addr-x", "phone": ".ph-x"}, "confidence": 0.75}"#,
        );
        let (engine, config) = setup(&dir, inference.clone());
        let html = r#"<ul>
            <li class="dealer"><h3>North Tractor</h3><span class="addr-x">1 Main St</span><span class="ph-x">555-0100</span></li>
            <li class="dealer"><h3>South Tractor</h3><span class="addr-x">2 Main St</span><span class="ph-x">555-0101</span></li>
        </ul>"#;

        let result = validate(&engine, &config, &outcome(html, 2, true)).await.unwrap();
        assert!(result.passed);
        assert_eq!(inference.calls(InferenceTask::ResultSelectors), 1);
        let layer = result.refined_layer.unwrap();
        assert_eq!(layer.data_fields["address"].selectors, [".addr-x"]);
        assert_eq!(layer.data_fields["phone"].selectors, [".ph-x"]);
        assert_eq!(layer.candidates(Role::ResultCard), ["li[class*='dealer' i]"]);

        // The committed fields now count as known.
        let refreshed = engine.store().get_merged(&config.identity).unwrap();
        validate(&engine, &refreshed, &outcome(html, 2, true)).await.unwrap();
        assert_eq!(inference.calls(InferenceTask::ResultSelectors), 1);
    }

    #[tokio::test]
    async fn test_field_learning_failure_still_passes() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new().fail(InferenceTask::ResultSelectors, "timeout");
        let (engine, config) = setup(&dir, inference.clone());
        let html = r#"<ul><li class="dealer"><h3>North</h3></li></ul>"#;
        let result = validate(&engine, &config, &outcome(html, 1, true)).await.unwrap();
        assert!(result.passed);
        assert!(result.refined_layer.is_none());
        assert!(engine.store().discovered(&config.identity).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_cards_alternate_rediscovery_commits() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new().respond(
            InferenceTask::ResultSelectors,
            r#"{"result_card": ".dealer-row", "data_fields": {"name": ".n", "phone": ".p"}, "confidence": 0.7}"#,
        );
        let (engine, config) = setup(&dir, inference.clone());
        let result = validate(&engine, &config, &outcome(ROWS, 0, true)).await.unwrap();

        assert!(result.passed);
        assert_eq!(result.observed_card_count, 2);
        assert_eq!(inference.calls(InferenceTask::ResultSelectors), 1);
        let layer = result.refined_layer.unwrap();
        assert_eq!(layer.candidates(Role::ResultCard), [".dealer-row"]);

        let merged = engine.store().get_merged(&config.identity).unwrap();
        assert_eq!(merged.candidates(Role::ResultCard)[0], ".dealer-row");
    }

    #[tokio::test]
    async fn test_zero_cards_without_match_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new().fail(InferenceTask::ResultSelectors, "connection refused");
        let (engine, config) = setup(&dir, inference.clone());
        let result = validate(&engine, &config, &outcome(EMPTY, 0, true)).await.unwrap();

        assert!(!result.passed);
        assert!(result.refined_layer.is_none());
        assert!(result.reason.contains("connection refused"));
        assert_eq!(inference.calls(InferenceTask::ResultSelectors), 1);
        assert!(engine.store().discovered(&config.identity).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsubmitted_search_fails_without_rediscovery() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new();
        let (engine, config) = setup(&dir, inference.clone());
        let result = validate(&engine, &config, &outcome(EMPTY, 0, false)).await.unwrap();
        assert!(!result.passed);
        assert!(inference.requests().is_empty());
    }

    #[tokio::test]
    async fn test_empty_fields_learn_field_selectors() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new().respond(
            InferenceTask::ResultSelectors,
            r#"{"result_card": "li.dealer", "data_fields": {"name": "span.lbl"}}"#,
        );
        let (engine, config) = setup(&dir, inference.clone());
        let html = r#"<ul>
            <li class="dealer"><span class="lbl">North</span></li>
            <li class="dealer"><span class="lbl">South</span></li>
        </ul>"#;
        let result = validate(&engine, &config, &outcome(html, 2, true)).await.unwrap();
        assert!(result.passed);
        let layer = result.refined_layer.unwrap();
        assert_eq!(layer.data_fields["name"].selectors, ["span.lbl"]);
    }
}
