//! Interaction executor: drives one search against a live page session.
//!
//! ```text
//! navigate ─► wait for search input ─► entry gate? ─► popups
//!          ─► fill + submit ─► poll for cards ─► paginate
//! ```
//!
//! With a direct URL template the form steps are skipped and the results
//! URL is opened directly. Every element lookup resolves candidates on the
//! current HTML first and then acts on the winning CSS, so the same
//! candidate syntax works for extraction and interaction.

pub mod pagination;
pub mod popup;

pub use pagination::{paginate, PaginationReport, PaginationRun, StopReason};
pub use popup::{handle_popups, PopupAction};

use crate::config::{Role, SiteConfig, SubmitStrategy};
use crate::discovery::{traverse_entry_gate, GateOutcome};
use crate::error::{HarvestError, HarvestResult};
use crate::extraction::{count_cards, resolve_target, Target};
use crate::inference::Inference;
use crate::renderer::RenderContext;
use serde::Serialize;
use std::time::{Duration, Instant};

/// What one interaction run observed.
#[derive(Debug, Clone, Serialize)]
pub struct InteractionOutcome {
    pub final_url: String,
    /// DOM snapshots to extract from; never empty.
    #[serde(skip)]
    pub snapshots: Vec<String>,
    /// A search was submitted (form, popup input or direct URL).
    pub submitted: bool,
    /// Cards matched when polling stopped.
    pub cards: usize,
    /// Cards never appeared within the post-submit bound.
    pub timed_out: bool,
    pub waited_ms: u64,
    pub gate: Option<GateOutcome>,
    pub popup: Option<PopupAction>,
    pub pagination: Option<PaginationReport>,
}

impl InteractionOutcome {
    /// The DOM the last extraction pass sees.
    pub fn final_html(&self) -> &str {
        self.snapshots.last().map(String::as_str).unwrap_or_default()
    }
}

/// Executes the search sequence for one site configuration.
pub struct InteractionExecutor<'a> {
    config: &'a SiteConfig,
    inference: &'a dyn Inference,
    navigation_timeout_ms: u64,
    poll_interval_ms: u64,
}

impl<'a> InteractionExecutor<'a> {
    pub fn new(config: &'a SiteConfig, inference: &'a dyn Inference) -> Self {
        Self {
            config,
            inference,
            navigation_timeout_ms: 30_000,
            poll_interval_ms: 500,
        }
    }

    pub fn with_navigation_timeout(mut self, ms: u64) -> Self {
        self.navigation_timeout_ms = ms;
        self
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms.max(10);
        self
    }

    fn site(&self) -> &str {
        self.config.identity.as_str()
    }

    /// Run the full sequence for `query`, starting at `entry_url`.
    ///
    /// Missing result cards are a soft outcome (`timed_out`); a search
    /// input that never resolves is an [`HarvestError::InteractionTimeout`].
    pub async fn run(
        &self,
        ctx: &mut dyn RenderContext,
        entry_url: &str,
        query: &str,
    ) -> HarvestResult<InteractionOutcome> {
        let site = self.site();
        let params = &self.config.interaction;
        let mut outcome = InteractionOutcome {
            final_url: entry_url.to_string(),
            snapshots: Vec::new(),
            submitted: false,
            cards: 0,
            timed_out: false,
            waited_ms: 0,
            gate: None,
            popup: None,
            pagination: None,
        };

        if let Some(template) = &params.direct_url_template {
            let url = direct_url(template, query);
            tracing::debug!(site, url = %url, "opening direct results URL");
            self.navigate(ctx, &url).await?;
            outcome.submitted = true;
            outcome.popup = Some(
                handle_popups(&*ctx, self.config, query, self.poll_interval_ms)
                    .await
                    .map_err(|e| HarvestError::session(site, e))?,
            );
        } else {
            self.navigate(ctx, entry_url).await?;
            self.search(&*ctx, query, &mut outcome).await?;
        }

        if outcome.submitted {
            let started = Instant::now();
            outcome.cards = self
                .wait_for_cards(&*ctx, params.post_submit_wait_ms)
                .await
                .map_err(|e| HarvestError::session(site, e))?;
            outcome.waited_ms = started.elapsed().as_millis() as u64;
            outcome.timed_out = outcome.cards == 0;
        }

        if outcome.cards > 0 {
            let run = paginate(&*ctx, self.config)
                .await
                .map_err(|e| HarvestError::session(site, e))?;
            outcome.snapshots = run.snapshots;
            outcome.pagination = Some(run.report);
        } else {
            let html = ctx
                .get_html()
                .await
                .map_err(|e| HarvestError::session(site, e))?;
            outcome.snapshots = vec![html];
        }
        outcome.final_url = ctx.get_url().await.unwrap_or(outcome.final_url);

        if outcome.timed_out {
            tracing::warn!(
                site,
                query,
                waited_ms = outcome.waited_ms,
                "no result cards after submitting search"
            );
        } else {
            tracing::debug!(site, query, cards = outcome.cards, "interaction finished");
        }
        Ok(outcome)
    }

    async fn navigate(&self, ctx: &mut dyn RenderContext, url: &str) -> HarvestResult<()> {
        ctx.navigate(url, self.navigation_timeout_ms)
            .await
            .map_err(|e| HarvestError::session(self.site(), e))?;
        Ok(())
    }

    /// Reveal the search input, clear popups, fill and submit.
    async fn search(
        &self,
        ctx: &dyn RenderContext,
        query: &str,
        outcome: &mut InteractionOutcome,
    ) -> HarvestResult<()> {
        let site = self.site();
        let params = &self.config.interaction;
        let session = |e: anyhow::Error| HarvestError::session(site, e);
        let not_found = || HarvestError::InteractionTimeout {
            site: site.to_string(),
            query: query.to_string(),
            waited_ms: params.page_load_wait_ms,
        };

        let found = self
            .wait_for_role(ctx, Role::SearchInput, params.page_load_wait_ms)
            .await
            .map_err(session)?;
        if found.is_none() {
            let gate = traverse_entry_gate(self.inference, ctx, self.config, self.poll_interval_ms)
                .await
                .map_err(session)?;
            tracing::debug!(site, checks = gate.checks, cleared = gate.cleared, "entry gate");
            outcome.gate = Some(gate);
        }

        let popup = handle_popups(ctx, self.config, query, self.poll_interval_ms)
            .await
            .map_err(session)?;
        let searched_in_popup = popup.submitted_search();
        outcome.popup = Some(popup);
        if searched_in_popup {
            outcome.submitted = true;
            return Ok(());
        }

        let html = ctx.get_html().await.map_err(session)?;
        let input = resolve_target(&html, self.config.candidates(Role::SearchInput))
            .ok_or_else(not_found)?;
        if !ctx
            .fill(&input.css, input.text.as_deref(), query)
            .await
            .map_err(session)?
        {
            return Err(not_found());
        }
        tracing::debug!(site, selector = %input.raw, "filled search input");

        outcome.submitted = self
            .submit(ctx, &html, &input, params.submit_strategy)
            .await
            .map_err(session)?;
        Ok(())
    }

    async fn submit(
        &self,
        ctx: &dyn RenderContext,
        html: &str,
        input: &Target,
        strategy: SubmitStrategy,
    ) -> anyhow::Result<bool> {
        if strategy != SubmitStrategy::Enter {
            if let Some(button) = resolve_target(html, self.config.candidates(Role::SubmitButton)) {
                if ctx.click(&button.css, button.text.as_deref()).await? {
                    tracing::debug!(site = self.site(), selector = %button.raw, "clicked submit");
                    return Ok(true);
                }
            }
            if strategy == SubmitStrategy::Click {
                tracing::warn!(site = self.site(), "no submit control resolves");
                return Ok(false);
            }
        }
        ctx.press_key(Some(&input.css), "Enter").await
    }

    /// Poll until a candidate for `role` resolves or `timeout_ms` passes.
    async fn wait_for_role(
        &self,
        ctx: &dyn RenderContext,
        role: Role,
        timeout_ms: u64,
    ) -> anyhow::Result<Option<Target>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let html = ctx.get_html().await?;
            if let Some(target) = resolve_target(&html, self.config.candidates(role)) {
                return Ok(Some(target));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(self.poll_interval_ms)).await;
        }
    }

    /// Poll for result cards; returns the count, zero on timeout.
    async fn wait_for_cards(&self, ctx: &dyn RenderContext, timeout_ms: u64) -> anyhow::Result<usize> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let cards = count_cards(&ctx.get_html().await?, self.config);
            if cards > 0 || Instant::now() >= deadline {
                return Ok(cards);
            }
            tokio::time::sleep(Duration::from_millis(self.poll_interval_ms)).await;
        }
    }
}

/// Fill `{query}` in a direct results URL, percent-encoded.
pub fn direct_url(template: &str, query: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    template.replace("{query}", &encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLayer, PaginationMode, SiteId};
    use crate::inference::{InferenceTask, NoopInference};
    use crate::renderer::Renderer;
    use crate::testing::{FakeRenderer, MockInference, ScriptedSite};

    const URL: &str = "https://a.com/dealers";
    const FORM: &str = r#"<form><input id="zip"><button id="go">Search</button></form>"#;
    const RESULTS: &str = r#"<ul>
        <li class="card"><h3>North</h3></li>
        <li class="card"><h3>South</h3></li>
        <li class="card"><h3>East</h3></li>
    </ul>"#;

    fn layer() -> ConfigLayer {
        let mut layer = ConfigLayer::default();
        for (role, candidates) in [
            (Role::SearchInput, vec!["#zip"]),
            (Role::SubmitButton, vec!["#go"]),
            (Role::ResultCard, vec!["li.card"]),
            (Role::EntryButton, vec!["#enter"]),
        ] {
            layer
                .selectors
                .insert(role, candidates.into_iter().map(String::from).collect());
        }
        layer.interaction.post_submit_wait_ms = Some(200);
        layer.interaction.page_load_wait_ms = Some(50);
        layer.interaction.pagination_mode = Some(PaginationMode::None);
        layer.interaction.pagination_delay_ms = Some(0);
        layer
    }

    fn config(layer: &ConfigLayer) -> SiteConfig {
        SiteConfig::merge(SiteId::new("a.com"), layer, None, None, false)
    }

    async fn run(
        site: &ScriptedSite,
        config: &SiteConfig,
        inference: &dyn Inference,
        query: &str,
    ) -> HarvestResult<InteractionOutcome> {
        let renderer = FakeRenderer::new(site.clone());
        let mut ctx = renderer.new_context().await.unwrap();
        InteractionExecutor::new(config, inference)
            .with_poll_interval(20)
            .run(ctx.as_mut(), URL, query)
            .await
    }

    #[tokio::test]
    async fn test_fill_click_and_collect_cards() {
        let site = ScriptedSite::new().page(URL, FORM).on_click(URL, "#go", RESULTS);
        let outcome = run(&site, &config(&layer()), &NoopInference, "10001")
            .await
            .unwrap();
        assert!(outcome.submitted);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.cards, 3);
        assert_eq!(outcome.snapshots.len(), 1);
        assert_eq!(site.fills(), [("#zip".to_string(), "10001".to_string())]);
        assert_eq!(site.clicks(), ["#go"]);
        assert!(outcome.gate.is_none());
    }

    #[tokio::test]
    async fn test_soft_timeout_when_no_cards_appear() {
        let site = ScriptedSite::new().page(URL, FORM);
        let outcome = run(&site, &config(&layer()), &NoopInference, "10001")
            .await
            .unwrap();
        assert!(outcome.submitted);
        assert!(outcome.timed_out);
        assert_eq!(outcome.cards, 0);
        assert!(outcome.waited_ms >= 200);
        assert_eq!(outcome.final_html(), FORM);
    }

    #[tokio::test]
    async fn test_enter_strategy_skips_button() {
        let mut layer = layer();
        layer.interaction.submit_strategy = Some(SubmitStrategy::Enter);
        let site = ScriptedSite::new().page(URL, FORM).on_enter(URL, RESULTS);
        let outcome = run(&site, &config(&layer), &NoopInference, "60601")
            .await
            .unwrap();
        assert_eq!(outcome.cards, 3);
        assert!(site.clicks().is_empty());
    }

    #[tokio::test]
    async fn test_click_then_enter_falls_back_to_enter() {
        let site = ScriptedSite::new()
            .page(URL, r#"<input id="zip">"#)
            .on_enter(URL, RESULTS);
        let outcome = run(&site, &config(&layer()), &NoopInference, "60601")
            .await
            .unwrap();
        assert_eq!(outcome.cards, 3);
    }

    #[tokio::test]
    async fn test_entry_gate_reveals_form() {
        let inference = MockInference::new().respond(
            InferenceTask::PageState,
            r#"{"has_search_input": false, "needs_entry_button": true, "entry_selector": "a.find"}"#,
        );
        let site = ScriptedSite::new()
            .page(URL, r#"<a class="find">Find a dealer</a>"#)
            .on_click(URL, "a.find", FORM)
            .on_click(URL, "#go", RESULTS);
        let outcome = run(&site, &config(&layer()), &inference, "10001")
            .await
            .unwrap();
        let gate = outcome.gate.unwrap();
        assert!(gate.cleared);
        assert_eq!(gate.checks, 1);
        assert_eq!(outcome.cards, 3);
        assert_eq!(site.clicks(), ["a.find", "#go"]);
    }

    #[tokio::test]
    async fn test_unresolvable_input_is_interaction_timeout() {
        let site = ScriptedSite::new().page(URL, "<p>closed for maintenance</p>");
        let err = run(&site, &config(&layer()), &NoopInference, "10001")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_navigation_failure_is_session_error() {
        let site = ScriptedSite::new().failing(URL);
        let err = run(&site, &config(&layer()), &NoopInference, "10001")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session_error");
    }

    #[tokio::test]
    async fn test_direct_url_skips_form() {
        let mut layer = layer();
        layer.interaction.direct_url_template = Some("https://a.com/find?zip={query}".into());
        let site = ScriptedSite::new().page("https://a.com/find?zip=60601", RESULTS);
        let outcome = run(&site, &config(&layer), &NoopInference, "60601")
            .await
            .unwrap();
        assert_eq!(site.navigations(), ["https://a.com/find?zip=60601"]);
        assert!(site.fills().is_empty());
        assert_eq!(outcome.cards, 3);
    }

    #[test]
    fn test_direct_url_encodes_query() {
        assert_eq!(
            direct_url("https://a.com/s?q={query}&r=50", "SW1A 1AA"),
            "https://a.com/s?q=SW1A+1AA&r=50"
        );
    }
}
