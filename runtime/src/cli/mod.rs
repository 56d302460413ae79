//! CLI subcommand implementations for the `harvest` binary.

pub mod config_cmd;
pub mod discover_cmd;
pub mod doctor;
pub mod output;
pub mod progress_bar;
pub mod run_cmd;

use crate::config::{ConfigStore, DiscoveredMergePolicy};
use crate::discovery::DiscoveryEngine;
use crate::fetch::{ContentFetcher, HttpContentFetcher};
use crate::inference::{Inference, NoopInference, OllamaClient};
use crate::settings::{parse_duration_ms, HarvestSettings};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

/// Settings flags shared by `run`, `discover` and `doctor`.
#[derive(Args, Debug, Clone)]
pub struct SettingsArgs {
    /// Directory holding base/discovered/override config layers
    #[arg(long)]
    pub config_dir: Option<PathBuf>,

    /// Directory for raw and final output files
    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,

    /// Sites processed concurrently
    #[arg(long, default_value = "2")]
    pub site_concurrency: usize,

    /// Query workers (browsers) per site
    #[arg(long, default_value = "1")]
    pub workers: usize,

    /// Relaunch a worker's browser after this many units
    #[arg(long, default_value = "25")]
    pub recycle_after: u32,

    /// Extra attempts for a query whose results never appear
    #[arg(long, default_value = "1")]
    pub retries: u32,

    /// Hard bound on one (site, query) unit, e.g. 180s or 3m
    #[arg(long, default_value = "180s", value_parser = parse_duration_arg)]
    pub unit_timeout: u64,

    /// Pause after this many consecutive failed units
    #[arg(long, default_value = "5")]
    pub failure_threshold: u32,

    /// Length of that pause, e.g. 30s
    #[arg(long, default_value = "30s", value_parser = parse_duration_arg)]
    pub cooldown: u64,

    /// What a new discovered layer does with the previous one (overwrite|merge)
    #[arg(long = "discovered-policy", default_value = "overwrite")]
    pub merge_policy: DiscoveredMergePolicy,

    /// Inference endpoint (Ollama-compatible)
    #[arg(long)]
    pub llm_endpoint: Option<String>,

    /// Inference model
    #[arg(long)]
    pub llm_model: Option<String>,

    /// Smaller model for page-state checks
    #[arg(long)]
    pub llm_fast_model: Option<String>,

    /// Run without inference (shipped and manual config only)
    #[arg(long)]
    pub no_llm: bool,

    /// Skip discovery for sites without a usable discovered layer
    #[arg(long)]
    pub no_discovery: bool,

    /// Skip post-search validation
    #[arg(long)]
    pub no_validation: bool,

    /// Show the browser window
    #[arg(long)]
    pub headed: bool,

    /// Chromium executable
    #[arg(long)]
    pub chromium_path: Option<PathBuf>,

    /// Reader service used to turn pages into prompt text
    #[arg(long)]
    pub reader_endpoint: Option<String>,
}

fn parse_duration_arg(raw: &str) -> Result<u64, String> {
    parse_duration_ms(raw).ok_or_else(|| format!("not a duration: {raw:?} (try 90s, 2m or 1500ms)"))
}

impl SettingsArgs {
    /// Flags first, then `LOCATOR_*` environment overrides, then validation.
    pub fn into_settings(self) -> Result<HarvestSettings> {
        let mut settings = HarvestSettings {
            site_concurrency: self.site_concurrency,
            workers_per_site: self.workers,
            recycle_after: self.recycle_after,
            max_query_retries: self.retries,
            unit_timeout_ms: self.unit_timeout,
            failure_threshold: self.failure_threshold,
            cooldown_ms: self.cooldown,
            discovery_enabled: !self.no_discovery,
            validation_enabled: !self.no_validation,
            headless: !self.headed,
            chromium_path: self.chromium_path,
            reader_endpoint: self.reader_endpoint,
            output_dir: self.output_dir,
            merge_policy: self.merge_policy,
            ..HarvestSettings::default()
        };
        if let Some(dir) = self.config_dir {
            settings.config_dir = dir;
        }
        settings.inference.enabled = !self.no_llm;
        if let Some(endpoint) = self.llm_endpoint {
            settings.inference.endpoint = endpoint;
        }
        if let Some(model) = self.llm_model {
            settings.inference.model = model;
        }
        if self.llm_fast_model.is_some() {
            settings.inference.fast_model = self.llm_fast_model;
        }

        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Inference client for `settings`, or the disabled stand-in.
pub fn build_inference(settings: &HarvestSettings) -> Arc<dyn Inference> {
    let cfg = &settings.inference;
    if !cfg.enabled {
        return Arc::new(NoopInference);
    }
    let mut client = OllamaClient::new(&cfg.endpoint, &cfg.model)
        .with_timeout_ms(cfg.timeout_ms)
        .with_temperature(cfg.temperature);
    if let Some(fast) = &cfg.fast_model {
        client = client.with_fast_model(fast);
    }
    Arc::new(client)
}

pub fn build_fetcher(settings: &HarvestSettings) -> Arc<dyn ContentFetcher> {
    let mut fetcher = HttpContentFetcher::new(settings.fetch_timeout_ms);
    if let Some(reader) = &settings.reader_endpoint {
        fetcher = fetcher.with_reader(reader);
    }
    Arc::new(fetcher)
}

pub fn open_store(settings: &HarvestSettings) -> Result<Arc<ConfigStore>> {
    let store = ConfigStore::open(settings.config_dir.clone())
        .with_context(|| format!("opening config store at {}", settings.config_dir.display()))?
        .with_policy(settings.merge_policy);
    Ok(Arc::new(store))
}

/// Discovery engine wired to the configured collaborators.
pub fn build_engine(settings: &HarvestSettings) -> Result<Arc<DiscoveryEngine>> {
    Ok(Arc::new(DiscoveryEngine::new(
        build_inference(settings),
        build_fetcher(settings),
        open_store(settings)?,
    )))
}
