//! Inference-driven discovery of per-site configuration.
//!
//! A site moves through [`DiscoveryState`]s:
//!
//! ```text
//! Homepage -> LocatorFound -> FormDiscovered -> ResultsDiscovered
//! ```
//!
//! The first two transitions run over plain HTTP content before any browser
//! session opens. `ResultsDiscovered` needs a rendered results page and is
//! driven by post-execution validation. Every transition degrades on
//! inference failure instead of failing: a zero-confidence layer is still
//! written so the locator URL is remembered, and base heuristics stay in
//! effect.

pub mod gate;
pub mod heuristics;
pub mod locator;
pub mod prompts;
pub mod response;

pub use gate::{check_page_state, traverse_entry_gate, GateOutcome, MAX_ENTRY_GATE_CHECKS};
pub use response::PageState;

use crate::config::{ConfigLayer, ConfigStore, Role, SiteId};
use crate::error::{HarvestError, HarvestResult};
use crate::extraction::resolve_target;
use crate::fetch::{truncate_for_prompt, ContentFetcher, FetchedContent};
use crate::inference::{parse_json_response, Inference, InferenceError, InferenceRequest, InferenceTask};
use heuristics::detect_cards;
use locator::{candidate_links, has_locator_signals, heuristic_confidence, same_page, MAX_CANDIDATES};
use response::{FormResponse, LocatorResponse, ResultsResponse};
use serde::Serialize;
use std::sync::Arc;
use url::Url;

/// Characters of page text sent with locator prompts.
pub const PROMPT_TEXT_CHARS: usize = 4_000;
/// Characters of compacted HTML sent with selector prompts.
pub const PROMPT_HTML_CHARS: usize = 8_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryState {
    Homepage,
    LocatorFound,
    FormDiscovered,
    ResultsDiscovered,
}

/// Where a locator decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorSource {
    Cached,
    Inference,
    Heuristic,
    /// The homepage itself carries the search, or could not be read.
    Homepage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocatorResolution {
    pub url: String,
    pub already_on_locator: bool,
    pub confidence: f32,
    pub source: LocatorSource,
}

impl LocatorResolution {
    fn homepage(url: &str, confidence: f32) -> Self {
        Self {
            url: url.to_string(),
            already_on_locator: true,
            confidence,
            source: LocatorSource::Homepage,
        }
    }
}

/// Outcome of the Homepage -> FormDiscovered transitions.
#[derive(Debug)]
pub struct SiteDiscovery {
    pub state: DiscoveryState,
    pub locator: LocatorResolution,
    /// The discovered layer as written.
    pub layer: ConfigLayer,
    /// Non-fatal failure that lowered confidence.
    pub degraded_by: Option<HarvestError>,
}

/// Which results discovery is being asked for.
#[derive(Debug, Clone, Copy)]
pub enum ResultsMode<'a> {
    /// Learn data fields for cards that already match `matched`.
    Initial { matched: &'a [String] },
    /// Find a card selector other than the ones that matched nothing.
    Alternate { failed: &'a [String] },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultsSource {
    Inference,
    Heuristic,
}

/// Outcome of a results discovery.
#[derive(Debug)]
pub struct ResultsDiscovery {
    /// The layer written, present only when the card selector matched.
    pub committed: Option<ConfigLayer>,
    pub card_selector: Option<String>,
    pub source: Option<ResultsSource>,
    pub error: Option<HarvestError>,
}

/// Drives discovery for any number of sites; cheap to share.
pub struct DiscoveryEngine {
    inference: Arc<dyn Inference>,
    fetcher: Arc<dyn ContentFetcher>,
    store: Arc<ConfigStore>,
}

impl DiscoveryEngine {
    pub fn new(
        inference: Arc<dyn Inference>,
        fetcher: Arc<dyn ContentFetcher>,
        store: Arc<ConfigStore>,
    ) -> Self {
        Self {
            inference,
            fetcher,
            store,
        }
    }

    pub fn inference(&self) -> &dyn Inference {
        self.inference.as_ref()
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Whether `site` lacks a fresh, non-zero-confidence discovered layer.
    pub fn needs_discovery(&self, site: &SiteId) -> HarvestResult<bool> {
        Ok(match self.store.discovered(site)? {
            Some(layer) => !self.store.is_fresh(&layer) || layer.confidence.unwrap_or(0.0) <= 0.0,
            None => true,
        })
    }

    /// Run Homepage -> LocatorFound -> FormDiscovered and persist the layer.
    ///
    /// Only store failures are errors.
    pub async fn discover_site(&self, site: &SiteId, homepage: &str) -> HarvestResult<SiteDiscovery> {
        tracing::info!(site = %site, "discovering locator page");
        let locator = self.resolve_locator(site, homepage).await?;
        tracing::info!(
            site = %site,
            url = %locator.url,
            already_on_locator = locator.already_on_locator,
            confidence = locator.confidence,
            source = ?locator.source,
            "locator page resolved"
        );

        let (layer, degraded_by) = self.discover_form(site, &locator).await?;
        let state = if layer.confidence.unwrap_or(0.0) > 0.0 {
            DiscoveryState::FormDiscovered
        } else {
            DiscoveryState::LocatorFound
        };
        Ok(SiteDiscovery {
            state,
            locator,
            layer,
            degraded_by,
        })
    }

    /// Homepage -> LocatorFound.
    pub async fn resolve_locator(&self, site: &SiteId, homepage: &str) -> HarvestResult<LocatorResolution> {
        if let Some(layer) = self.store.discovered(site)?.filter(|l| self.store.is_fresh(l)) {
            if let Some(url) = &layer.locator_url {
                return Ok(LocatorResolution {
                    url: url.clone(),
                    already_on_locator: layer.already_on_locator.unwrap_or(false),
                    confidence: layer.confidence.unwrap_or(0.0),
                    source: LocatorSource::Cached,
                });
            }
        }

        let content = match self.fetcher.fetch(homepage).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(site = %site, "homepage fetch failed, treating it as the locator: {e:#}");
                return Ok(LocatorResolution::homepage(homepage, 0.0));
            }
        };
        let page_url = if content.final_url.is_empty() {
            homepage.to_string()
        } else {
            content.final_url.clone()
        };

        if self.homepage_is_locator(&content) {
            return Ok(LocatorResolution::homepage(&page_url, 0.8));
        }

        let links = candidate_links(&content.html, &page_url, MAX_CANDIDATES);
        let Some(best) = links.first().cloned() else {
            return Ok(LocatorResolution::homepage(&page_url, 0.3));
        };

        let request = InferenceRequest::new(
            InferenceTask::LocatorChoice,
            prompts::locator_prompt(&page_url, &links),
            truncate_for_prompt(&content.text, PROMPT_TEXT_CHARS),
        );
        match self.infer::<LocatorResponse>(&request).await {
            Ok(choice) => {
                let confidence = choice.confidence.unwrap_or(0.7).clamp(0.0, 1.0);
                if choice.already_on_locator {
                    return Ok(LocatorResolution {
                        source: LocatorSource::Inference,
                        ..LocatorResolution::homepage(&page_url, confidence)
                    });
                }
                if let Some(url) = choice.locator_url.as_deref().and_then(|u| internal_url(&page_url, u)) {
                    let already = same_page(&url, &page_url);
                    return Ok(LocatorResolution {
                        url: if already { page_url } else { url },
                        already_on_locator: already,
                        confidence,
                        source: LocatorSource::Inference,
                    });
                }
                tracing::debug!(site = %site, "locator choice unusable: {:?}", choice.locator_url);
            }
            Err(e) => tracing::warn!(site = %site, "locator inference failed: {e}"),
        }

        Ok(LocatorResolution {
            url: best.url,
            already_on_locator: false,
            confidence: heuristic_confidence(best.score),
            source: LocatorSource::Heuristic,
        })
    }

    fn homepage_is_locator(&self, content: &FetchedContent) -> bool {
        let base = self.store.base();
        if let Some(cards) = resolve_target(&content.html, base.candidates(Role::ResultCard)) {
            if cards.count >= 2 {
                return true;
            }
        }
        resolve_target(&content.html, base.candidates(Role::SearchInput)).is_some()
            && has_locator_signals(&content.text)
    }

    /// LocatorFound -> FormDiscovered. Writes the discovered layer, with
    /// confidence 0 when the model's answer was unusable.
    pub async fn discover_form(
        &self,
        site: &SiteId,
        locator: &LocatorResolution,
    ) -> HarvestResult<(ConfigLayer, Option<HarvestError>)> {
        let mut degraded_by = None;
        let mut layer = match self.fetcher.fetch(&locator.url).await {
            Ok(content) => {
                let body = if content.html.trim().is_empty() {
                    truncate_for_prompt(&content.text, PROMPT_HTML_CHARS)
                } else {
                    prompts::compact_html(&content.html, PROMPT_HTML_CHARS)
                };
                let mut request =
                    InferenceRequest::new(InferenceTask::FormSelectors, prompts::form_prompt(&locator.url), body);
                if let Some(shot) = content.screenshot {
                    request = request.with_images(vec![shot]);
                }
                match self.infer::<FormResponse>(&request).await {
                    Ok(response) => response.into_layer(),
                    Err(e) => {
                        tracing::warn!(site = %site, "form discovery failed: {e}");
                        degraded_by = Some(HarvestError::discovery(site.as_str(), &e));
                        zero_confidence()
                    }
                }
            }
            Err(e) => {
                tracing::warn!(site = %site, url = %locator.url, "locator fetch failed: {e:#}");
                degraded_by = Some(HarvestError::DiscoveryFailed {
                    site: site.to_string(),
                    reason: format!("fetch {}: {e:#}", locator.url),
                });
                zero_confidence()
            }
        };

        layer.locator_url = Some(locator.url.clone());
        layer.already_on_locator = Some(locator.already_on_locator);
        let written = self.store.put_discovered(site, layer).await?;
        Ok((written, degraded_by))
    }

    /// FormDiscovered -> ResultsDiscovered over a rendered results page.
    ///
    /// The refined layer is committed only when its card selector matches
    /// `html`. In initial mode an answer with field rules but no usable card
    /// selector keeps the matched one. In alternate mode a model failure
    /// falls back to [`heuristics::detect_cards`].
    pub async fn discover_results(
        &self,
        site: &SiteId,
        page_url: &str,
        html: &str,
        mode: ResultsMode<'_>,
    ) -> HarvestResult<ResultsDiscovery> {
        let (failed, matched): (&[String], &[String]) = match mode {
            ResultsMode::Initial { matched } => (&[], matched),
            ResultsMode::Alternate { failed } => (failed, &[]),
        };
        let fields: Vec<String> = self.store.base().data_fields.keys().cloned().collect();
        let request = InferenceRequest::new(
            InferenceTask::ResultSelectors,
            prompts::results_prompt(page_url, &fields, failed),
            prompts::compact_html(html, PROMPT_HTML_CHARS),
        );

        let mut error = None;
        let mut proposal: Option<(Vec<String>, ResultsResponse, ResultsSource)> = None;
        match self.infer::<ResultsResponse>(&request).await {
            Ok(response) => {
                let mut cards: Vec<String> = response
                    .card_candidates()
                    .into_iter()
                    .filter(|c| !failed.contains(c))
                    .collect();
                if resolve_target(html, &cards).is_none()
                    && !response.field_rules().is_empty()
                    && resolve_target(html, matched).is_some()
                {
                    cards = matched.to_vec();
                }
                if resolve_target(html, &cards).is_some() {
                    proposal = Some((cards, response, ResultsSource::Inference));
                } else {
                    tracing::debug!(site = %site, "proposed card selectors match nothing: {cards:?}");
                }
            }
            Err(e) => {
                tracing::warn!(site = %site, "results discovery failed: {e}");
                error = Some(HarvestError::discovery(site.as_str(), &e));
            }
        }

        if proposal.is_none() && matches!(mode, ResultsMode::Alternate { .. }) {
            if let Some(found) = detect_cards(html) {
                tracing::info!(site = %site, selector = %found.selector, count = found.count, "heuristic card match");
                let response = ResultsResponse {
                    confidence: Some(found.confidence),
                    ..Default::default()
                };
                proposal = Some((vec![found.selector], response, ResultsSource::Heuristic));
            }
        }

        let Some((cards, response, source)) = proposal else {
            return Ok(ResultsDiscovery {
                committed: None,
                card_selector: None,
                source: None,
                error,
            });
        };

        let mut layer = self.store.discovered(site)?.unwrap_or_default();
        layer.selectors.insert(Role::ResultCard, cards.clone());
        for (name, rule) in response.field_rules() {
            layer.data_fields.insert(name, rule);
        }
        let previous = layer.confidence.unwrap_or(0.0);
        layer.confidence = Some(response.confidence.unwrap_or(0.6).clamp(0.0, 1.0).max(previous));
        if response.notes.is_some() {
            layer.notes = response.notes.clone();
        }
        let committed = self.store.put_discovered(site, layer).await?;

        Ok(ResultsDiscovery {
            committed: Some(committed),
            card_selector: cards.into_iter().next(),
            source: Some(source),
            error,
        })
    }

    async fn infer<T: serde::de::DeserializeOwned>(&self, request: &InferenceRequest) -> Result<T, InferenceError> {
        let text = self.inference.infer(request).await?;
        parse_json_response(&text)
    }
}

fn zero_confidence() -> ConfigLayer {
    ConfigLayer {
        confidence: Some(0.0),
        ..Default::default()
    }
}

/// Resolve a model-proposed URL against the page and keep it only when it
/// stays on the same site.
fn internal_url(page_url: &str, proposed: &str) -> Option<String> {
    let base = Url::parse(page_url).ok()?;
    let resolved = base.join(proposed.trim()).ok()?;
    let host = |u: &Url| u.host_str().map(|h| h.trim_start_matches("www.").to_ascii_lowercase());
    (matches!(resolved.scheme(), "http" | "https") && host(&resolved) == host(&base))
        .then(|| resolved.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockFetcher, MockInference};

    const HOMEPAGE: &str = r#"<html><body>
        <nav><a href="/about">About</a><a href="/find-a-dealer">Find a Dealer</a>
        <a href="/shop">Shop</a></nav><h1>Acme Tractors</h1></body></html>"#;

    const LOCATOR: &str = r#"<html><body>
        <form><input id="zip" placeholder="ZIP code"><button id="go">Search</button></form>
        <ul id="results"></ul></body></html>"#;

    fn engine(dir: &tempfile::TempDir, inference: MockInference) -> DiscoveryEngine {
        let store = ConfigStore::open(dir.path().to_path_buf()).unwrap();
        let fetcher = MockFetcher::new()
            .page("https://acme.com/", HOMEPAGE)
            .page("https://acme.com/find-a-dealer", LOCATOR);
        DiscoveryEngine::new(Arc::new(inference), Arc::new(fetcher), Arc::new(store))
    }

    #[tokio::test]
    async fn test_locator_from_inference() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new().respond(
            InferenceTask::LocatorChoice,
            r#"{"locator_url": "/find-a-dealer", "confidence": 0.9}"#,
        );
        let engine = engine(&dir, inference);
        let site = SiteId::new("acme.com");
        let resolution = engine.resolve_locator(&site, "https://acme.com/").await.unwrap();
        assert_eq!(resolution.url, "https://acme.com/find-a-dealer");
        assert!(!resolution.already_on_locator);
        assert_eq!(resolution.source, LocatorSource::Inference);
    }

    #[tokio::test]
    async fn test_same_url_means_already_on_locator() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new().respond(
            InferenceTask::LocatorChoice,
            r#"{"locator_url": "https://www.acme.com", "confidence": 0.6}"#,
        );
        let engine = engine(&dir, inference);
        let resolution = engine
            .resolve_locator(&SiteId::new("acme.com"), "https://acme.com/")
            .await
            .unwrap();
        assert!(resolution.already_on_locator);
        assert_eq!(resolution.url, "https://acme.com/");
    }

    #[tokio::test]
    async fn test_inference_failure_falls_back_to_best_link() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(&dir, MockInference::new());
        let resolution = engine
            .resolve_locator(&SiteId::new("acme.com"), "https://acme.com/")
            .await
            .unwrap();
        assert_eq!(resolution.url, "https://acme.com/find-a-dealer");
        assert_eq!(resolution.source, LocatorSource::Heuristic);
        assert!(resolution.confidence > 0.0 && resolution.confidence <= 0.9);
    }

    #[tokio::test]
    async fn test_external_locator_choice_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new().respond(
            InferenceTask::LocatorChoice,
            r#"{"locator_url": "https://evil.example/dealers"}"#,
        );
        let engine = engine(&dir, inference);
        let resolution = engine
            .resolve_locator(&SiteId::new("acme.com"), "https://acme.com/")
            .await
            .unwrap();
        assert_eq!(resolution.source, LocatorSource::Heuristic);
    }

    #[tokio::test]
    async fn test_discover_site_writes_layer() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new()
            .respond(InferenceTask::LocatorChoice, r#"{"locator_url": "/find-a-dealer"}"#)
            .respond(
                InferenceTask::FormSelectors,
                r##"{"selectors": {"search_input": ["#zip"], "submit_button": ["#go"],
                    "result_card": ["#results li"]}, "confidence": 0.85}"##,
            );
        let engine = engine(&dir, inference);
        let site = SiteId::new("acme.com");
        assert!(engine.needs_discovery(&site).unwrap());

        let outcome = engine.discover_site(&site, "https://acme.com/").await.unwrap();
        assert_eq!(outcome.state, DiscoveryState::FormDiscovered);
        assert!(outcome.degraded_by.is_none());

        let stored = engine.store().discovered(&site).unwrap().unwrap();
        assert_eq!(stored.candidates(Role::SearchInput), ["#zip"]);
        assert_eq!(stored.locator_url.as_deref(), Some("https://acme.com/find-a-dealer"));
        assert!(stored.generated_at.is_some());
        assert!(!engine.needs_discovery(&site).unwrap());

        // A fresh layer short-circuits the locator step.
        let cached = engine.resolve_locator(&site, "https://acme.com/").await.unwrap();
        assert_eq!(cached.source, LocatorSource::Cached);
    }

    #[tokio::test]
    async fn test_unparseable_form_response_writes_zero_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let inference = MockInference::new()
            .respond(InferenceTask::LocatorChoice, r#"{"locator_url": "/find-a-dealer"}"#)
            .respond(InferenceTask::FormSelectors, "I could not find a form, sorry.");
        let engine = engine(&dir, inference);
        let site = SiteId::new("acme.com");

        let outcome = engine.discover_site(&site, "https://acme.com/").await.unwrap();
        assert_eq!(outcome.state, DiscoveryState::LocatorFound);
        assert!(matches!(outcome.degraded_by, Some(HarvestError::DiscoveryFailed { .. })));
        assert_eq!(outcome.layer.confidence, Some(0.0));

        // Merged view keeps base selectors.
        let merged = engine.store().get_merged(&site).unwrap();
        assert_eq!(merged.candidates(Role::SearchInput), engine.store().base().candidates(Role::SearchInput));
        assert_eq!(merged.locator_url.as_deref(), Some("https://acme.com/find-a-dealer"));
    }

    #[tokio::test]
    async fn test_alternate_results_commit_only_on_match() {
        let dir = tempfile::tempdir().unwrap();
        let html = r#"<ul><li class="loc">Acme North 555-0100</li><li class="loc">Acme South</li></ul>"#;
        let inference = MockInference::new()
            .respond_once(InferenceTask::ResultSelectors, r#"{"result_card": [".nope"]}"#)
            .respond(
                InferenceTask::ResultSelectors,
                r#"{"result_card": ["li.loc"], "data_fields": {"name": "li"}, "confidence": 0.8}"#,
            );
        let engine = engine(&dir, inference);
        let site = SiteId::new("acme.com");
        let failed = vec![".dealer-card".to_string()];

        let miss = engine
            .discover_results(&site, "https://acme.com/find-a-dealer", html, ResultsMode::Alternate { failed: &failed })
            .await
            .unwrap();
        assert!(miss.committed.is_none());
        assert!(engine.store().discovered(&site).unwrap().is_none());

        let hit = engine
            .discover_results(&site, "https://acme.com/find-a-dealer", html, ResultsMode::Alternate { failed: &failed })
            .await
            .unwrap();
        assert_eq!(hit.card_selector.as_deref(), Some("li.loc"));
        assert_eq!(hit.source, Some(ResultsSource::Inference));
        let stored = engine.store().discovered(&site).unwrap().unwrap();
        assert_eq!(stored.candidates(Role::ResultCard), ["li.loc"]);
    }

    #[tokio::test]
    async fn test_alternate_falls_back_to_heuristic_cards() {
        let dir = tempfile::tempdir().unwrap();
        let card = |name: &str| {
            format!(r#"<div class="store-tile"><h4>{name}</h4><p>1200 Commerce Parkway, Springfield, IL 62701</p></div>"#)
        };
        let html = format!("<body>{}{}{}</body>", card("North Farm"), card("South Farm"), card("East Farm"));
        let inference = MockInference::new().fail(InferenceTask::ResultSelectors, "model unavailable");
        let engine = engine(&dir, inference);
        let site = SiteId::new("acme.com");
        let failed = vec!["li.dealer".to_string()];

        let found = engine
            .discover_results(&site, "https://acme.com/find-a-dealer", &html, ResultsMode::Alternate { failed: &failed })
            .await
            .unwrap();
        assert_eq!(found.source, Some(ResultsSource::Heuristic));
        assert_eq!(found.card_selector.as_deref(), Some("[class*='store' i]"));
        assert!(found.error.is_some());
        assert!(found.committed.is_some());
    }

    #[tokio::test]
    async fn test_initial_keeps_matched_card_selector() {
        let dir = tempfile::tempdir().unwrap();
        let html = r#"<ul><li class="dealer"><b>North</b><i class="ph">555</i></li></ul>"#;
        let inference = MockInference::new().respond(
            InferenceTask::ResultSelectors,
            r#"{"data_fields": {"phone": "i.ph"}}"#,
        );
        let engine = engine(&dir, inference);
        let site = SiteId::new("acme.com");
        let matched = vec!["li.dealer".to_string()];

        let found = engine
            .discover_results(&site, "https://acme.com/find-a-dealer", html, ResultsMode::Initial { matched: &matched })
            .await
            .unwrap();
        assert_eq!(found.card_selector.as_deref(), Some("li.dealer"));
        let layer = found.committed.unwrap();
        assert_eq!(layer.data_fields["phone"].selectors, ["i.ph"]);
    }
}
