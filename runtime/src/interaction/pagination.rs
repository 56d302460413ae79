//! Revealing results beyond the first batch.
//!
//! Growth is measured on distinct card texts rather than element counts,
//! so a virtualised list that recycles a fixed number of nodes still
//! registers new cards. Two consecutive attempts without growth stop the
//! loop.

use crate::config::{PaginationMode, Role, SiteConfig};
use crate::extraction::candidate::element_text;
use crate::extraction::{resolve, resolve_target};
use crate::renderer::RenderContext;
use anyhow::Result;
use scraper::Html;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

/// Non-growing attempts tolerated before stopping.
pub const MAX_STALLS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Disabled,
    /// No pagination control resolves any more.
    NoControl,
    Stalled,
    MaxIterations,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaginationReport {
    pub mode: PaginationMode,
    pub iterations: u32,
    pub stop: StopReason,
    pub distinct_cards: usize,
}

/// DOM snapshots to extract from, plus what happened.
#[derive(Debug)]
pub struct PaginationRun {
    /// Every snapshot for virtual scroll; otherwise only the final DOM.
    pub snapshots: Vec<String>,
    pub report: PaginationReport,
}

/// Texts of the cards currently in `html`.
fn card_texts(html: &str, config: &SiteConfig) -> Vec<String> {
    let doc = Html::parse_document(html);
    resolve(&doc, config.candidates(Role::ResultCard))
        .map(|r| r.elements.iter().map(element_text).collect())
        .unwrap_or_default()
}

/// Paginate from the current page state.
pub async fn paginate(ctx: &dyn RenderContext, config: &SiteConfig) -> Result<PaginationRun> {
    let params = &config.interaction;
    let mode = params.pagination_mode;
    let mut html = ctx.get_html().await?;
    let mut seen: HashSet<String> = card_texts(&html, config).into_iter().collect();
    let mut snapshots = vec![html.clone()];
    let mut iterations = 0;
    let mut stalls = 0;

    let stop = loop {
        if mode == PaginationMode::None {
            break StopReason::Disabled;
        }
        if iterations >= params.max_pagination {
            break StopReason::MaxIterations;
        }

        match mode {
            PaginationMode::ClickMore => {
                let Some(control) = resolve_target(&html, config.candidates(Role::PaginationControl))
                else {
                    break StopReason::NoControl;
                };
                if !ctx.click(&control.css, control.text.as_deref()).await? {
                    break StopReason::NoControl;
                }
            }
            PaginationMode::VirtualScroll | PaginationMode::PlainScroll => {
                ctx.scroll_to_bottom(None).await?;
            }
            PaginationMode::None => break StopReason::Disabled,
        }
        iterations += 1;
        tokio::time::sleep(Duration::from_millis(params.pagination_delay_ms)).await;

        html = ctx.get_html().await?;
        let before = seen.len();
        seen.extend(card_texts(&html, config));
        if mode == PaginationMode::VirtualScroll {
            snapshots.push(html.clone());
        }

        if seen.len() > before {
            stalls = 0;
        } else {
            stalls += 1;
            if stalls >= MAX_STALLS {
                break StopReason::Stalled;
            }
        }
    };

    if mode != PaginationMode::VirtualScroll {
        snapshots = vec![html];
    }
    tracing::debug!(
        mode = ?mode,
        iterations,
        stop = ?stop,
        cards = seen.len(),
        "pagination finished"
    );
    Ok(PaginationRun {
        snapshots,
        report: PaginationReport {
            mode,
            iterations,
            stop,
            distinct_cards: seen.len(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLayer, SiteId};
    use crate::renderer::Renderer;
    use crate::testing::{FakeRenderer, ScriptedSite};

    const URL: &str = "https://a.com/dealers";

    fn cards(range: std::ops::Range<usize>, more: bool) -> String {
        let items: String = range.map(|i| format!("<li class=\"card\">Dealer {i}</li>")).collect();
        let button = if more { "<button class=\"more\">Load More</button>" } else { "" };
        format!("<ul>{items}</ul>{button}")
    }

    fn config(mode: PaginationMode, max: u32) -> SiteConfig {
        let mut layer = ConfigLayer::default();
        layer.selectors.insert(Role::ResultCard, vec!["li.card".into()]);
        layer
            .selectors
            .insert(Role::PaginationControl, vec!["button.more".into()]);
        layer.interaction.pagination_mode = Some(mode);
        layer.interaction.max_pagination = Some(max);
        layer.interaction.pagination_delay_ms = Some(0);
        SiteConfig::merge(SiteId::new("a.com"), &layer, None, None, false)
    }

    async fn run(site: ScriptedSite, config: &SiteConfig) -> PaginationRun {
        let renderer = FakeRenderer::new(site);
        let mut ctx = renderer.new_context().await.unwrap();
        ctx.navigate(URL, 1_000).await.unwrap();
        paginate(ctx.as_ref(), config).await.unwrap()
    }

    #[tokio::test]
    async fn test_click_more_until_control_disappears() {
        let site = ScriptedSite::new().page(URL, &cards(0..5, true)).on_click_sequence(
            URL,
            "button.more",
            vec![cards(0..10, true), cards(0..15, false)],
        );
        let run = run(site.clone(), &config(PaginationMode::ClickMore, 30)).await;
        assert_eq!(run.report.stop, StopReason::NoControl);
        assert_eq!(run.report.iterations, 2);
        assert_eq!(run.report.distinct_cards, 15);
        assert_eq!(run.snapshots.len(), 1);
        assert_eq!(site.clicks().len(), 2);
    }

    #[tokio::test]
    async fn test_stops_after_two_stalls() {
        let site = ScriptedSite::new()
            .page(URL, &cards(0..5, true))
            .on_click_sequence(URL, "button.more", vec![cards(0..8, true)]);
        let run = run(site.clone(), &config(PaginationMode::ClickMore, 30)).await;
        assert_eq!(run.report.stop, StopReason::Stalled);
        assert_eq!(run.report.iterations, 3);
        assert_eq!(run.report.distinct_cards, 8);
    }

    #[tokio::test]
    async fn test_max_iterations_bound() {
        let states: Vec<String> = (1..10).map(|i| cards(0..5 + i * 5, true)).collect();
        let site = ScriptedSite::new()
            .page(URL, &cards(0..5, true))
            .on_click_sequence(URL, "button.more", states);
        let run = run(site, &config(PaginationMode::ClickMore, 3)).await;
        assert_eq!(run.report.stop, StopReason::MaxIterations);
        assert_eq!(run.report.iterations, 3);
    }

    #[tokio::test]
    async fn test_virtual_scroll_keeps_snapshots() {
        let site = ScriptedSite::new()
            .page(URL, &cards(0..5, false))
            .on_scroll(URL, vec![cards(5..10, false), cards(10..12, false)]);
        let run = run(site, &config(PaginationMode::VirtualScroll, 30)).await;
        assert_eq!(run.report.distinct_cards, 12);
        assert_eq!(run.report.stop, StopReason::Stalled);
        // initial + 4 scroll attempts (2 growing, 2 stalled)
        assert_eq!(run.snapshots.len(), 5);
        assert!(run.snapshots[1].contains("Dealer 5"));
    }

    #[tokio::test]
    async fn test_disabled() {
        let site = ScriptedSite::new().page(URL, &cards(0..5, true));
        let run = run(site.clone(), &config(PaginationMode::None, 30)).await;
        assert_eq!(run.report.stop, StopReason::Disabled);
        assert!(site.clicks().is_empty());
    }
}
