//! Popup and consent-banner handling.

use crate::config::{Role, SiteConfig};
use crate::extraction::resolve_target;
use crate::renderer::RenderContext;
use anyhow::Result;
use serde::Serialize;
use std::time::Duration;

/// What popup handling did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PopupAction {
    /// Nothing matched; Escape was still sent.
    Proceeded,
    /// A dismiss control was clicked.
    Dismissed { selector: String },
    /// The popup carried its own search input; it was filled and submitted.
    SearchedInPopup { selector: String },
}

impl PopupAction {
    pub fn submitted_search(&self) -> bool {
        matches!(self, Self::SearchedInPopup { .. })
    }
}

/// Escape plus the first resolving `popup_dismiss` candidate; failing that,
/// a `popup_zip_input` is filled with `query` and submitted with Enter.
pub async fn handle_popups(
    ctx: &dyn RenderContext,
    config: &SiteConfig,
    query: &str,
    settle_ms: u64,
) -> Result<PopupAction> {
    ctx.press_key(None, "Escape").await?;

    let html = ctx.get_html().await?;
    if let Some(target) = resolve_target(&html, config.candidates(Role::PopupDismiss)) {
        if ctx.click(&target.css, target.text.as_deref()).await? {
            tracing::debug!(selector = %target.raw, "dismissed popup");
            tokio::time::sleep(Duration::from_millis(settle_ms)).await;
            return Ok(PopupAction::Dismissed {
                selector: target.raw,
            });
        }
    }

    if let Some(target) = resolve_target(&html, config.candidates(Role::PopupZipInput)) {
        if ctx.fill(&target.css, target.text.as_deref(), query).await? {
            ctx.press_key(Some(&target.css), "Enter").await?;
            tracing::debug!(selector = %target.raw, "searched through popup input");
            return Ok(PopupAction::SearchedInPopup {
                selector: target.raw,
            });
        }
    }

    Ok(PopupAction::Proceeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLayer, SiteId};
    use crate::renderer::Renderer;
    use crate::testing::{FakeRenderer, PageAction, ScriptedSite};

    fn config(dismiss: &[&str], zip: &[&str]) -> SiteConfig {
        let mut layer = ConfigLayer::default();
        layer.selectors.insert(
            Role::PopupDismiss,
            dismiss.iter().map(|s| s.to_string()).collect(),
        );
        layer
            .selectors
            .insert(Role::PopupZipInput, zip.iter().map(|s| s.to_string()).collect());
        SiteConfig::merge(SiteId::new("a.com"), &layer, None, None, false)
    }

    #[tokio::test]
    async fn test_dismiss_wins() {
        let site = ScriptedSite::new().page(
            "https://a.com/",
            r#"<div class="modal"><button id="accept">Accept All</button><input name="zip"></div>"#,
        );
        let renderer = FakeRenderer::new(site.clone());
        let mut ctx = renderer.new_context().await.unwrap();
        ctx.navigate("https://a.com/", 1_000).await.unwrap();

        let action = handle_popups(
            ctx.as_ref(),
            &config(&["#missing", "button:has-text(\"accept all\")"], &["input[name='zip']"]),
            "10001",
            0,
        )
        .await
        .unwrap();
        assert_eq!(
            action,
            PopupAction::Dismissed {
                selector: "button:has-text(\"accept all\")".into()
            }
        );
        assert_eq!(site.clicks(), ["button"]);
        assert!(site.fills().is_empty());
    }

    #[tokio::test]
    async fn test_popup_zip_input_fallback() {
        let site = ScriptedSite::new().page(
            "https://a.com/",
            r#"<div role="dialog"><input placeholder="Enter ZIP"></div>"#,
        );
        let renderer = FakeRenderer::new(site.clone());
        let mut ctx = renderer.new_context().await.unwrap();
        ctx.navigate("https://a.com/", 1_000).await.unwrap();

        let action = handle_popups(
            ctx.as_ref(),
            &config(&["#close"], &["[role='dialog'] input"]),
            "60601",
            0,
        )
        .await
        .unwrap();
        assert!(action.submitted_search());
        assert_eq!(site.fills(), [("[role='dialog'] input".to_string(), "60601".to_string())]);
        let keys: Vec<_> = site
            .actions()
            .into_iter()
            .filter_map(|a| match a.action {
                PageAction::Key(k) => Some(k),
                _ => None,
            })
            .collect();
        assert_eq!(keys, ["Escape", "Enter"]);
    }

    #[tokio::test]
    async fn test_nothing_to_handle() {
        let site = ScriptedSite::new().page("https://a.com/", "<p>clean</p>");
        let renderer = FakeRenderer::new(site);
        let mut ctx = renderer.new_context().await.unwrap();
        ctx.navigate("https://a.com/", 1_000).await.unwrap();
        let action = handle_popups(ctx.as_ref(), &config(&["#close"], &[]), "1", 0)
            .await
            .unwrap();
        assert_eq!(action, PopupAction::Proceeded);
    }
}
