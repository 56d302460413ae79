//! Entry-gate traversal.
//!
//! Some locator pages hide the search input behind a "Find a dealer" or
//! "Get started" control. The gate loop asks the fast model whether the
//! input is visible, clicks the proposed entry control, and re-checks, at
//! most [`MAX_ENTRY_GATE_CHECKS`] times before falling back to the
//! configured `entry_button` candidates.

use super::prompts::{compact_html, page_state_prompt};
use super::response::{usable_selector, PageState};
use crate::config::{Role, SiteConfig};
use crate::extraction::resolve_target;
use crate::inference::{parse_json_response, Inference, InferenceError, InferenceRequest, InferenceTask};
use crate::renderer::RenderContext;
use anyhow::Result;
use serde::Serialize;
use std::time::Duration;

pub const MAX_ENTRY_GATE_CHECKS: u32 = 3;

const PAGE_STATE_CHARS: usize = 4_000;

/// What the gate loop did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GateOutcome {
    /// Page-state checks issued.
    pub checks: u32,
    pub clicks: u32,
    /// A configured search-input candidate resolves afterwards.
    pub cleared: bool,
    /// The configured `entry_button` candidates were used.
    pub fell_back: bool,
}

/// One fast-tier page-state check.
pub async fn check_page_state(
    inference: &dyn Inference,
    url: &str,
    html: &str,
) -> Result<PageState, InferenceError> {
    let request = InferenceRequest::new(
        InferenceTask::PageState,
        page_state_prompt(url),
        compact_html(html, PAGE_STATE_CHARS),
    )
    .fast();
    let text = inference.infer(&request).await?;
    parse_json_response(&text)
}

/// Try to reveal the search input on the current page.
pub async fn traverse_entry_gate(
    inference: &dyn Inference,
    ctx: &dyn RenderContext,
    config: &SiteConfig,
    settle_ms: u64,
) -> Result<GateOutcome> {
    let search = config.candidates(Role::SearchInput);
    let mut outcome = GateOutcome::default();

    while outcome.checks < MAX_ENTRY_GATE_CHECKS {
        let html = ctx.get_html().await?;
        if resolve_target(&html, search).is_some() {
            outcome.cleared = true;
            return Ok(outcome);
        }

        let url = ctx.get_url().await.unwrap_or_default();
        outcome.checks += 1;
        let state = match check_page_state(inference, &url, &html).await {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!(url = %url, "page-state check failed: {e}");
                break;
            }
        };
        if !state.needs_entry_button {
            break;
        }

        let candidates = entry_candidates(&state, config);
        let Some(target) = resolve_target(&html, &candidates) else {
            tracing::debug!(url = %url, "no entry control resolves");
            break;
        };
        if ctx.click(&target.css, target.text.as_deref()).await? {
            outcome.clicks += 1;
            tracing::debug!(url = %url, selector = %target.raw, "clicked entry control");
            tokio::time::sleep(Duration::from_millis(settle_ms)).await;
        } else {
            break;
        }
    }

    let html = ctx.get_html().await?;
    if resolve_target(&html, search).is_some() {
        outcome.cleared = true;
        return Ok(outcome);
    }

    outcome.fell_back = true;
    if let Some(target) = resolve_target(&html, config.candidates(Role::EntryButton)) {
        if ctx.click(&target.css, target.text.as_deref()).await? {
            outcome.clicks += 1;
            tokio::time::sleep(Duration::from_millis(settle_ms)).await;
        }
    }
    let html = ctx.get_html().await?;
    outcome.cleared = resolve_target(&html, search).is_some();
    Ok(outcome)
}

/// Model-proposed entry controls first, then configured ones.
fn entry_candidates(state: &PageState, config: &SiteConfig) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(selector) = state.entry_selector.as_deref().filter(|s| usable_selector(s)) {
        out.push(selector.trim().to_string());
    }
    if let Some(label) = state.entry_text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let label = label.replace('"', "");
        for tag in ["button", "a", "[role='button']"] {
            out.push(format!("{tag}:has-text(\"{label}\")"));
        }
    }
    out.extend(config.candidates(Role::EntryButton).iter().cloned());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLayer, SiteId};

    #[test]
    fn test_entry_candidates_order() {
        let mut base = ConfigLayer::default();
        base.selectors
            .insert(Role::EntryButton, vec!["button.start".into()]);
        let config = SiteConfig::merge(SiteId::new("acme.com"), &base, None, None, false);
        let state = PageState {
            has_search_input: false,
            needs_entry_button: true,
            entry_selector: Some("#open-locator".into()),
            entry_text: Some("Find a \"Dealer\"".into()),
        };
        let candidates = entry_candidates(&state, &config);
        assert_eq!(candidates[0], "#open-locator");
        assert_eq!(candidates[1], "button:has-text(\"Find a Dealer\")");
        assert_eq!(candidates.last().map(String::as_str), Some("button.start"));
    }
}
