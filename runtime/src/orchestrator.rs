//! Run orchestration: sites x query keys.
//!
//! Sites run `site_concurrency` at a time. Within a site, up to
//! `workers_per_site` query workers pull query keys from a shared queue;
//! each worker owns its browser and relaunches it every `recycle_after`
//! units. Records are appended to the raw sinks as units finish, then
//! deduplicated and written once the site's workers have joined.

use crate::config::SiteId;
use crate::discovery::{DiscoveryEngine, DiscoveryState};
use crate::error::HarvestError;
use crate::harvest::{SiteHarvest, UnitLimits, UnitReport};
use crate::output::{file_timestamp, write_site_output, RecordSink, SiteOutput};
use crate::progress::{Emitter, HarvestEventKind};
use crate::records::{dedup, ResultRecord};
use crate::renderer::{Renderer, RendererFactory};
use crate::settings::HarvestSettings;
use crate::validation::ValidationStatus;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteOutcome {
    Succeeded,
    /// Records were produced but validation failed.
    Degraded,
    Failed,
}

impl SiteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
        }
    }
}

/// Per-site line of the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct SiteSummary {
    pub site: String,
    pub homepage: String,
    pub outcome: SiteOutcome,
    /// Records after deduplication.
    pub records: usize,
    pub raw_records: usize,
    pub units: usize,
    pub failed_units: usize,
    pub discovery: Option<DiscoveryState>,
    pub validation: Option<ValidationStatus>,
    pub output: Option<SiteOutput>,
    pub error: Option<String>,
}

impl SiteSummary {
    fn failed(site: &str, homepage: &str, error: &HarvestError) -> Self {
        Self {
            site: site.to_string(),
            homepage: homepage.to_string(),
            outcome: SiteOutcome::Failed,
            records: 0,
            raw_records: 0,
            units: 0,
            failed_units: 0,
            discovery: None,
            validation: None,
            output: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub sites: Vec<SiteSummary>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    fn count(&self, outcome: SiteOutcome) -> usize {
        self.sites.iter().filter(|s| s.outcome == outcome).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(SiteOutcome::Succeeded)
    }

    pub fn degraded(&self) -> usize {
        self.count(SiteOutcome::Degraded)
    }

    pub fn failed(&self) -> usize {
        self.count(SiteOutcome::Failed)
    }

    pub fn total_records(&self) -> usize {
        self.sites.iter().map(|s| s.records).sum()
    }

    /// 0 when at least one site produced a record.
    pub fn exit_code(&self) -> i32 {
        if self.sites.iter().any(|s| s.records > 0) {
            0
        } else {
            1
        }
    }
}

pub struct Orchestrator {
    settings: HarvestSettings,
    engine: Arc<DiscoveryEngine>,
    factory: Arc<dyn RendererFactory>,
    sink: Arc<dyn RecordSink>,
    emitter: Emitter,
}

impl Orchestrator {
    pub fn new(
        settings: HarvestSettings,
        engine: Arc<DiscoveryEngine>,
        factory: Arc<dyn RendererFactory>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            settings,
            engine,
            factory,
            sink,
            emitter: Emitter::disabled(),
        }
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    /// Harvest every site for every query key.
    pub async fn run(&self, sites: &[String], queries: &[String]) -> RunSummary {
        let started = Instant::now();
        tracing::info!(
            run_id = %self.emitter.run_id(),
            sites = sites.len(),
            queries = queries.len(),
            "harvest run started"
        );
        self.emitter.emit(HarvestEventKind::RunStarted {
            sites: sites.len(),
            queries: queries.len(),
        });

        let mut results: Vec<(usize, SiteSummary)> = stream::iter(sites.iter().enumerate())
            .map(|(i, homepage)| async move { (i, self.run_site(homepage, queries).await) })
            .buffer_unordered(self.settings.site_concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(i, _)| *i);

        let summary = RunSummary {
            run_id: self.emitter.run_id().to_string(),
            sites: results.into_iter().map(|(_, s)| s).collect(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            succeeded = summary.succeeded(),
            degraded = summary.degraded(),
            failed = summary.failed(),
            records = summary.total_records(),
            elapsed_ms = summary.elapsed_ms,
            "harvest run finished"
        );
        self.emitter.emit(HarvestEventKind::RunFinished {
            succeeded: summary.succeeded(),
            degraded: summary.degraded(),
            failed: summary.failed(),
            records: summary.total_records(),
            elapsed_ms: summary.elapsed_ms,
        });
        summary
    }

    /// Discover (when needed) and harvest one site.
    pub async fn run_site(&self, homepage: &str, queries: &[String]) -> SiteSummary {
        let site = match SiteId::from_url(homepage) {
            Ok(site) => site,
            Err(e) => return self.finish_failed(homepage, homepage, &HarvestError::from(e)),
        };
        self.emitter.emit(HarvestEventKind::SiteStarted {
            site: site.to_string(),
        });

        let discovery = match self.discover(&site, homepage).await {
            Ok(state) => state,
            Err(e) => return self.finish_failed(site.as_str(), homepage, &e),
        };

        let config = match self.engine.store().get_merged(&site) {
            Ok(config) => config,
            Err(e) => return self.finish_failed(site.as_str(), homepage, &HarvestError::from(e)),
        };
        if config.layers.discovered_stale {
            tracing::warn!(site = %site, "using stale discovered config");
        }
        let entry_url = config
            .locator_url
            .clone()
            .unwrap_or_else(|| homepage.to_string());

        let harvest = Arc::new(
            SiteHarvest::new(
                config,
                &entry_url,
                self.engine.clone(),
                self.sink.clone(),
                self.settings.validation_enabled,
            )
            .with_emitter(self.emitter.clone())
            .with_limits(self.limits()),
        );
        let reports = self.run_workers(&harvest, queries).await;
        if let Err(e) = self.sink.finish_site(site.as_str()) {
            tracing::warn!(site = %site, "failed to close raw output: {e:#}");
        }

        let raw: Vec<ResultRecord> = reports.iter().flat_map(|r| r.records.iter().cloned()).collect();
        let records = dedup(&raw);
        let output = if records.is_empty() {
            None
        } else {
            match write_site_output(&self.settings.output_dir, &site, &records, &file_timestamp()) {
                Ok(output) => Some(output),
                Err(e) => {
                    tracing::warn!(site = %site, "failed to write site output: {e:#}");
                    None
                }
            }
        };

        let validation = harvest.validation_status();
        let discovery = if harvest.results_discovered() {
            Some(DiscoveryState::ResultsDiscovered)
        } else {
            discovery
        };
        let outcome = match (records.is_empty(), validation) {
            (true, _) => SiteOutcome::Failed,
            (false, ValidationStatus::Degraded) => SiteOutcome::Degraded,
            (false, _) => SiteOutcome::Succeeded,
        };
        let failed_units = reports.iter().filter(|r| !r.is_success()).count();
        let error = (outcome == SiteOutcome::Failed)
            .then(|| reports.iter().rev().find_map(|r| r.error.as_ref().map(|e| e.to_string())))
            .flatten();

        tracing::info!(
            site = %site,
            outcome = outcome.as_str(),
            records = records.len(),
            raw = raw.len(),
            "site finished"
        );
        self.emitter.emit(HarvestEventKind::SiteFinished {
            site: site.to_string(),
            outcome: outcome.as_str().to_string(),
            records: records.len(),
        });

        SiteSummary {
            site: site.to_string(),
            homepage: homepage.to_string(),
            outcome,
            records: records.len(),
            raw_records: raw.len(),
            units: reports.len(),
            failed_units,
            discovery,
            validation: Some(validation),
            output,
            error,
        }
    }

    /// Run discovery when the site lacks a fresh, confident layer.
    async fn discover(&self, site: &SiteId, homepage: &str) -> Result<Option<DiscoveryState>, HarvestError> {
        if !self.settings.discovery_enabled || !self.engine.needs_discovery(site)? {
            return Ok(None);
        }
        let discovered = self.engine.discover_site(site, homepage).await?;
        if let Some(e) = &discovered.degraded_by {
            self.emitter.emit(HarvestEventKind::Warning {
                message: e.to_string(),
            });
        }
        self.emitter.emit(HarvestEventKind::DiscoveryAdvanced {
            site: site.to_string(),
            state: discovered.state,
            confidence: discovered.layer.confidence.unwrap_or(0.0),
        });
        Ok(Some(discovered.state))
    }

    async fn run_workers(&self, harvest: &Arc<SiteHarvest>, queries: &[String]) -> Vec<UnitReport> {
        let queue = Arc::new(Mutex::new(queries.iter().cloned().collect::<VecDeque<_>>()));
        let workers = self.settings.workers_per_site.clamp(1, queries.len().max(1));

        let mut set = JoinSet::new();
        for id in 0..workers {
            let worker = QueryWorker {
                id,
                harvest: harvest.clone(),
                factory: self.factory.clone(),
                queue: queue.clone(),
                recycle_after: self.settings.recycle_after.max(1),
                failure_threshold: self.settings.failure_threshold.max(1),
                cooldown: Duration::from_millis(self.settings.cooldown_ms),
                emitter: self.emitter.clone(),
            };
            set.spawn(worker.run());
        }

        let mut reports = Vec::with_capacity(queries.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(mut done) => reports.append(&mut done),
                Err(e) => tracing::error!(site = %harvest.site(), "query worker panicked: {e}"),
            }
        }
        reports
    }

    fn limits(&self) -> UnitLimits {
        UnitLimits {
            unit_timeout_ms: self.settings.unit_timeout_ms,
            navigation_timeout_ms: self.settings.navigation_timeout_ms,
            poll_interval_ms: self.settings.poll_interval_ms,
            max_query_retries: self.settings.max_query_retries,
        }
    }

    fn finish_failed(&self, site: &str, homepage: &str, error: &HarvestError) -> SiteSummary {
        tracing::error!(site, kind = error.kind(), "site failed: {error}");
        self.emitter.emit(HarvestEventKind::SiteFinished {
            site: site.to_string(),
            outcome: SiteOutcome::Failed.as_str().to_string(),
            records: 0,
        });
        SiteSummary::failed(site, homepage, error)
    }
}

/// One query worker: owns a browser, pulls query keys until the queue is
/// empty.
struct QueryWorker {
    id: usize,
    harvest: Arc<SiteHarvest>,
    factory: Arc<dyn RendererFactory>,
    queue: Arc<Mutex<VecDeque<String>>>,
    recycle_after: u32,
    failure_threshold: u32,
    cooldown: Duration,
    emitter: Emitter,
}

impl QueryWorker {
    fn next_query(&self) -> Option<String> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    async fn run(self) -> Vec<UnitReport> {
        let site = self.harvest.site().clone();
        let mut reports = Vec::new();
        let mut browser: Option<Arc<dyn Renderer>> = None;
        let mut units_on_browser = 0u32;
        let mut failures = 0u32;

        while let Some(query) = self.next_query() {
            let renderer = match &browser {
                Some(renderer) => renderer.clone(),
                None => match self.factory.launch().await {
                    Ok(renderer) => {
                        browser = Some(renderer.clone());
                        renderer
                    }
                    Err(e) => {
                        let error = HarvestError::session(site.as_str(), e.context("browser launch failed"));
                        tracing::warn!(site = %site, worker = self.id, "{error}");
                        reports.push(UnitReport::failed(&site, &query, error));
                        failures += 1;
                        self.maybe_cool_down(&mut failures).await;
                        continue;
                    }
                },
            };

            let report = self.harvest.run_unit(renderer.as_ref(), &query).await;
            if report.is_success() {
                failures = 0;
            } else {
                failures += 1;
            }
            reports.push(report);

            units_on_browser += 1;
            if units_on_browser >= self.recycle_after {
                if let Some(old) = browser.take() {
                    shutdown(old.as_ref(), &site).await;
                }
                tracing::debug!(site = %site, worker = self.id, units = units_on_browser, "browser recycled");
                self.emitter.emit(HarvestEventKind::BrowserRecycled {
                    site: site.to_string(),
                    worker: self.id,
                    units: units_on_browser,
                });
                units_on_browser = 0;
            }
            self.maybe_cool_down(&mut failures).await;
        }

        if let Some(renderer) = browser {
            shutdown(renderer.as_ref(), &site).await;
        }
        reports
    }

    async fn maybe_cool_down(&self, failures: &mut u32) {
        if *failures < self.failure_threshold {
            return;
        }
        let site = self.harvest.site();
        tracing::warn!(
            site = %site,
            worker = self.id,
            failures = *failures,
            "too many consecutive failures, cooling down for {}ms",
            self.cooldown.as_millis()
        );
        self.emitter.emit(HarvestEventKind::WorkerCooldown {
            site: site.to_string(),
            worker: self.id,
            failures: *failures,
            cooldown_ms: self.cooldown.as_millis() as u64,
        });
        tokio::time::sleep(self.cooldown).await;
        *failures = 0;
    }
}

async fn shutdown(renderer: &dyn Renderer, site: &SiteId) {
    if let Err(e) = renderer.shutdown().await {
        tracing::debug!(site = %site, "browser shutdown failed: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLayer, ConfigStore, PaginationMode, Role};
    use crate::progress::{channel, HarvestEvent};
    use crate::testing::{FakeFactory, MemorySink, MockFetcher, MockInference, ScriptedSite};

    const URL: &str = "https://acme.com/";
    const FORM: &str = r#"<form><input id="zip"><button id="go">Search</button></form>"#;

    fn results(names: &[&str]) -> String {
        let cards: String = names
            .iter()
            .map(|n| format!(r#"<li class="dealer"><h3>{n}</h3><address>{n} Rd</address></li>"#))
            .collect();
        format!("<ul>{cards}</ul>")
    }

    fn settings(dir: &tempfile::TempDir) -> HarvestSettings {
        HarvestSettings {
            workers_per_site: 2,
            recycle_after: 1,
            unit_timeout_ms: 5_000,
            navigation_timeout_ms: 1_000,
            poll_interval_ms: 10,
            cooldown_ms: 10,
            discovery_enabled: false,
            output_dir: dir.path().join("out"),
            config_dir: dir.path().join("configs"),
            ..Default::default()
        }
    }

    fn override_layer() -> ConfigLayer {
        let mut layer = ConfigLayer::default();
        layer.selectors.insert(Role::SearchInput, vec!["#zip".into()]);
        layer.selectors.insert(Role::SubmitButton, vec!["#go".into()]);
        layer.interaction.post_submit_wait_ms = Some(100);
        layer.interaction.page_load_wait_ms = Some(20);
        layer.interaction.pagination_mode = Some(PaginationMode::None);
        layer
    }

    fn orchestrator(settings: &HarvestSettings, store: ConfigStore, site: &ScriptedSite, sink: &MemorySink) -> Orchestrator {
        let overrides = settings.config_dir.join("overrides");
        std::fs::create_dir_all(&overrides).unwrap();
        std::fs::write(
            overrides.join("acme_com.json"),
            serde_json::to_vec(&override_layer()).unwrap(),
        )
        .unwrap();
        let engine = DiscoveryEngine::new(
            Arc::new(MockInference::new()),
            Arc::new(MockFetcher::new()),
            Arc::new(store),
        );
        Orchestrator::new(
            settings.clone(),
            Arc::new(engine),
            Arc::new(FakeFactory::new(site.clone())),
            Arc::new(sink.clone()),
        )
    }

    #[tokio::test]
    async fn test_site_harvest_dedups_across_queries() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let store = ConfigStore::open(settings.config_dir.clone()).unwrap();
        let site = ScriptedSite::new()
            .page(URL, FORM)
            .on_click(URL, "#go", &results(&["North", "South", "North"]));
        let sink = MemorySink::new();
        let orchestrator = orchestrator(&settings, store, &site, &sink);

        let queries = vec!["10001".to_string(), "60601".to_string(), "94105".to_string()];
        let summary = orchestrator.run(&[URL.to_string()], &queries).await;

        let acme = &summary.sites[0];
        assert_eq!(acme.outcome, SiteOutcome::Succeeded);
        assert_eq!(acme.units, 3);
        assert_eq!(acme.raw_records, 9);
        assert_eq!(acme.records, 2);
        assert_eq!(sink.records().len(), 9);
        assert_eq!(sink.finished_sites(), ["acme.com"]);
        assert_eq!(summary.exit_code(), 0);

        let output = acme.output.as_ref().unwrap();
        let json: Vec<serde_json::Value> =
            serde_json::from_slice(&std::fs::read(&output.json).unwrap()).unwrap();
        assert_eq!(json.len(), 2);

        // recycle_after = 1: one launch and one shutdown per unit
        assert_eq!(site.launches(), 3);
        assert_eq!(site.shutdowns(), 3);
        assert_eq!(site.contexts_opened(), site.contexts_closed());
    }

    #[tokio::test]
    async fn test_missing_required_role_fails_site_only() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir);
        let mut base = ConfigLayer::default();
        base.selectors.insert(Role::SearchInput, vec!["#zip".into()]);
        let store = ConfigStore::open(settings.config_dir.clone()).unwrap().with_base(base);
        let site = ScriptedSite::new().page(URL, FORM);
        let orchestrator = orchestrator(&settings, store, &site, &MemorySink::new());

        let summary = orchestrator
            .run(&[URL.to_string(), "https://other.example/".to_string()], &["10001".to_string()])
            .await;
        assert_eq!(summary.sites.len(), 2);
        assert_eq!(summary.failed(), 2);
        assert!(summary.sites[0].error.as_ref().unwrap().contains("result_card"));
        assert_eq!(site.launches(), 0);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_consecutive_failures_trigger_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let settings = HarvestSettings {
            workers_per_site: 1,
            recycle_after: 100,
            failure_threshold: 2,
            max_query_retries: 0,
            ..settings(&dir)
        };
        let store = ConfigStore::open(settings.config_dir.clone()).unwrap();
        let site = ScriptedSite::new().failing(URL);
        let (tx, mut rx) = channel();
        let orchestrator =
            orchestrator(&settings, store, &site, &MemorySink::new()).with_emitter(Emitter::new(Some(tx), "run-1"));

        let queries: Vec<String> = (0..4).map(|i| format!("1000{i}")).collect();
        let summary = orchestrator.run(&[URL.to_string()], &queries).await;
        assert_eq!(summary.sites[0].failed_units, 4);
        assert_eq!(site.launches(), 1);

        let mut cooldowns = 0;
        while let Ok(HarvestEvent { event, .. }) = rx.try_recv() {
            if matches!(event, HarvestEventKind::WorkerCooldown { .. }) {
                cooldowns += 1;
            }
        }
        assert_eq!(cooldowns, 2);
    }
}
