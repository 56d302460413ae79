//! `harvest discover <url>`: run discovery for one site and show the
//! merged config it produces.

use crate::cli::output;
use crate::cli::{build_engine, SettingsArgs};
use crate::config::{Role, SiteConfig, SiteId};
use crate::discovery::{DiscoveryEngine, DiscoveryState, LocatorSource};
use anyhow::Result;
use clap::Args;
use serde::Serialize;

#[derive(Args, Debug)]
pub struct DiscoverArgs {
    /// Site homepage URL
    pub url: String,

    /// Drop the existing discovered layer first
    #[arg(long)]
    pub fresh: bool,

    #[command(flatten)]
    pub settings: SettingsArgs,
}

#[derive(Debug, Serialize)]
pub struct DiscoverReport {
    pub site: SiteId,
    pub state: DiscoveryState,
    pub locator_url: String,
    pub locator_source: LocatorSource,
    pub already_on_locator: bool,
    pub degraded_by: Option<String>,
    pub config: SiteConfig,
}

/// Discover `homepage` and merge the result with the other layers.
pub async fn discover(engine: &DiscoveryEngine, homepage: &str, fresh: bool) -> Result<DiscoverReport> {
    let site = SiteId::from_url(homepage)?;
    if fresh && engine.store().remove_discovered(&site)? {
        tracing::info!(site = %site, "dropped existing discovered layer");
    }
    let discovery = engine.discover_site(&site, homepage).await?;
    let config = engine.store().get_merged(&site)?;
    Ok(DiscoverReport {
        site,
        state: discovery.state,
        locator_url: discovery.locator.url,
        locator_source: discovery.locator.source,
        already_on_locator: discovery.locator.already_on_locator,
        degraded_by: discovery.degraded_by.map(|e| e.to_string()),
        config,
    })
}

pub async fn run(args: DiscoverArgs) -> Result<()> {
    let settings = args.settings.into_settings()?;
    let engine = build_engine(&settings)?;
    let report = discover(&engine, &args.url, args.fresh).await?;

    if output::is_json() {
        output::print_json(&report);
        return Ok(());
    }
    if output::is_quiet() {
        return Ok(());
    }

    println!("Site:       {}", report.site);
    println!("State:      {:?}", report.state);
    println!(
        "Locator:    {} ({:?}{})",
        report.locator_url,
        report.locator_source,
        if report.already_on_locator { ", search on page" } else { "" }
    );
    println!("Confidence: {:.2}", report.config.confidence);
    if let Some(reason) = &report.degraded_by {
        println!("Degraded:   {reason}");
    }
    println!();
    for role in [Role::SearchInput, Role::SubmitButton, Role::ResultCard, Role::PaginationControl] {
        let candidates = report.config.candidates(role);
        println!(
            "{} {:<20} {}",
            output::mark(!candidates.is_empty()),
            role.as_str(),
            candidates.first().map(String::as_str).unwrap_or("-")
        );
    }
    if let Some(role) = report.config.missing_required_role() {
        println!();
        println!("  Missing {role}; add it under overrides/{}.json", report.site.file_stem());
    }
    Ok(())
}
