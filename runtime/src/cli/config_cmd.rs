//! `harvest config show|clear <url>`: inspect or reset a site's layers.

use crate::cli::output;
use crate::config::{store::default_root, ConfigLayer, ConfigStore, SiteConfig, SiteId};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Directory holding base/discovered/override config layers
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the merged config and each stored layer for a site
    Show {
        /// Site homepage URL or bare host
        url: String,
    },
    /// Delete the discovered layer so the next run rediscovers the site
    Clear {
        /// Site homepage URL or bare host
        url: String,
    },
}

#[derive(Debug, Serialize)]
struct ShowReport {
    site: SiteId,
    fresh: bool,
    merged: SiteConfig,
    discovered: Option<ConfigLayer>,
    manual_override: Option<ConfigLayer>,
}

/// Accept `https://www.acme.com/x` as well as `acme.com`.
fn site_id(raw: &str) -> Result<SiteId> {
    SiteId::from_url(raw).with_context(|| format!("not a site: {raw}"))
}

pub async fn run(args: ConfigArgs) -> Result<()> {
    let root = args.config_dir.unwrap_or_else(default_root);
    let store = ConfigStore::open(root.clone())
        .with_context(|| format!("opening config store at {}", root.display()))?;

    match args.action {
        ConfigAction::Show { url } => show(&store, &site_id(&url)?),
        ConfigAction::Clear { url } => clear(&store, &site_id(&url)?),
    }
}

fn show(store: &ConfigStore, site: &SiteId) -> Result<()> {
    let discovered = store.discovered(site)?;
    let report = ShowReport {
        site: site.clone(),
        fresh: discovered.as_ref().is_some_and(|l| store.is_fresh(l)),
        merged: store.get_merged(site)?,
        discovered,
        manual_override: store.manual_override(site)?,
    };

    if output::is_json() {
        output::print_json(&report);
        return Ok(());
    }

    let stem = site.file_stem();
    println!("Site: {site}");
    println!("Store: {}", store.root().display());
    println!();
    match &report.discovered {
        Some(layer) => println!(
            "{} discovered/{stem}.json (confidence {:.2}{})",
            output::mark(report.fresh),
            layer.confidence.unwrap_or(0.0),
            if report.fresh { "" } else { ", stale" }
        ),
        None => println!("[--] discovered/{stem}.json (none)"),
    }
    match &report.manual_override {
        Some(_) => println!("[OK] overrides/{stem}.json"),
        None => println!("[--] overrides/{stem}.json (none)"),
    }
    println!();
    output::print_json(&report.merged);
    Ok(())
}

fn clear(store: &ConfigStore, site: &SiteId) -> Result<()> {
    let removed = store.remove_discovered(site)?;
    if output::is_json() {
        output::print_json(&serde_json::json!({ "site": site, "removed": removed }));
    } else if !output::is_quiet() {
        if removed {
            println!("Cleared discovered config for {site}");
        } else {
            println!("No discovered config for {site}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_id_accepts_bare_hosts() {
        assert_eq!(site_id("www.Acme.com").unwrap().as_str(), "acme.com");
        assert_eq!(site_id("https://acme.com/dealers").unwrap().as_str(), "acme.com");
    }

    #[tokio::test]
    async fn test_clear_removes_discovered_layer() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path().to_path_buf()).unwrap();
        let site = SiteId::new("acme.com");
        let layer = ConfigLayer {
            confidence: Some(0.9),
            ..Default::default()
        };
        store.put_discovered(&site, layer).await.unwrap();
        assert!(store.discovered(&site).unwrap().is_some());

        clear(&store, &site).unwrap();
        assert!(store.discovered(&site).unwrap().is_none());
        clear(&store, &site).unwrap();
    }
}
