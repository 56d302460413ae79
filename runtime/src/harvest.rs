//! One (site, query-key) unit of work.
//!
//! ```text
//! OPEN_SESSION -> INTERACT -> [VALIDATE once per site] -> EXTRACT
//!              -> PERSIST -> CLOSE_SESSION
//! ```
//!
//! A unit never propagates an error to its caller: everything ends up in
//! the returned [`UnitReport`]. The session is closed on every path,
//! including when the unit deadline cancels the work in flight.

use crate::config::{SiteConfig, SiteId};
use crate::discovery::{DiscoveryEngine, DiscoveryState};
use crate::error::{HarvestError, HarvestResult};
use crate::extraction::{extract_snapshots, RecordContext};
use crate::interaction::{InteractionExecutor, InteractionOutcome};
use crate::output::RecordSink;
use crate::progress::{Emitter, HarvestEventKind};
use crate::records::ResultRecord;
use crate::renderer::{RenderContext, Renderer};
use crate::validation::{validate, SiteValidator, ValidationStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// A browser context scoped to one unit.
pub struct DiscoverySession {
    id: String,
    ctx: Box<dyn RenderContext>,
}

impl DiscoverySession {
    pub async fn open(renderer: &dyn Renderer, site: &SiteId) -> HarvestResult<Self> {
        let ctx = renderer
            .new_context()
            .await
            .map_err(|e| HarvestError::session(site.as_str(), e))?;
        let id = format!("sess-{}", uuid::Uuid::new_v4());
        tracing::debug!(site = %site, session = %id, "session opened");
        Ok(Self { id, ctx })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&mut self) -> &mut dyn RenderContext {
        self.ctx.as_mut()
    }

    /// Close the context. Failures are logged, never returned.
    pub async fn close(self) {
        let id = self.id;
        if let Err(e) = self.ctx.close().await {
            tracing::debug!(session = %id, "session close failed: {e:#}");
        }
    }
}

/// Unit-level knobs taken from the run settings.
#[derive(Debug, Clone, Copy)]
pub struct UnitLimits {
    pub unit_timeout_ms: u64,
    pub navigation_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_query_retries: u32,
}

impl Default for UnitLimits {
    fn default() -> Self {
        Self {
            unit_timeout_ms: 180_000,
            navigation_timeout_ms: 30_000,
            poll_interval_ms: 500,
            max_query_retries: 1,
        }
    }
}

/// Everything the units of one site share.
pub struct SiteHarvest {
    site: SiteId,
    entry_url: String,
    config: RwLock<SiteConfig>,
    engine: Arc<DiscoveryEngine>,
    validator: SiteValidator,
    results_discovered: AtomicBool,
    sink: Arc<dyn RecordSink>,
    emitter: Emitter,
    limits: UnitLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// At least one record carried a field value.
    Succeeded,
    /// The unit ran but produced nothing usable.
    Empty,
    Failed,
}

/// Outcome of one unit.
#[derive(Debug)]
pub struct UnitReport {
    pub site: SiteId,
    pub query: String,
    pub session_id: Option<String>,
    pub status: UnitStatus,
    pub records: Vec<ResultRecord>,
    pub attempts: u32,
    pub error: Option<HarvestError>,
    /// Set on the unit that ran validation.
    pub validation: Option<ValidationStatus>,
    pub elapsed_ms: u64,
}

impl UnitReport {
    fn new(site: &SiteId, query: &str, status: UnitStatus) -> Self {
        Self {
            site: site.clone(),
            query: query.to_string(),
            session_id: None,
            status,
            records: Vec::new(),
            attempts: 0,
            error: None,
            validation: None,
            elapsed_ms: 0,
        }
    }

    pub fn failed(site: &SiteId, query: &str, error: HarvestError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(site, query, UnitStatus::Failed)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Succeeded
    }
}

/// Releases an unfinished validation claim when dropped, so a cancelled
/// unit hands validation to the next one.
struct ClaimGuard<'a>(&'a SiteValidator);

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

struct Interacted {
    outcome: InteractionOutcome,
    attempts: u32,
    validation: Option<ValidationStatus>,
}

impl SiteHarvest {
    pub fn new(
        config: SiteConfig,
        entry_url: &str,
        engine: Arc<DiscoveryEngine>,
        sink: Arc<dyn RecordSink>,
        validation_enabled: bool,
    ) -> Self {
        Self {
            site: config.identity.clone(),
            entry_url: entry_url.to_string(),
            config: RwLock::new(config),
            engine,
            validator: SiteValidator::new(validation_enabled),
            results_discovered: AtomicBool::new(false),
            sink,
            emitter: Emitter::disabled(),
            limits: UnitLimits::default(),
        }
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_limits(mut self, limits: UnitLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn site(&self) -> &SiteId {
        &self.site
    }

    pub fn validation_status(&self) -> ValidationStatus {
        self.validator.status()
    }

    /// Whether validation committed a results-page layer.
    pub fn results_discovered(&self) -> bool {
        self.results_discovered.load(Ordering::Acquire)
    }

    /// Current merged config; replaced after a refinement.
    pub fn config(&self) -> SiteConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn refresh_config(&self) {
        match self.engine.store().get_merged(&self.site) {
            Ok(merged) => *self.config.write().unwrap_or_else(PoisonError::into_inner) = merged,
            Err(e) => tracing::warn!(site = %self.site, "keeping previous config: {e}"),
        }
    }

    /// Run one unit to completion. Never fails; see [`UnitReport`].
    pub async fn run_unit(&self, renderer: &dyn Renderer, query: &str) -> UnitReport {
        let started = Instant::now();
        let mut report = match DiscoverySession::open(renderer, &self.site).await {
            Ok(session) => self.in_session(session, query).await,
            Err(e) => UnitReport::failed(&self.site, query, e),
        };
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.emit_report(&report);
        report
    }

    async fn in_session(&self, mut session: DiscoverySession, query: &str) -> UnitReport {
        let session_id = session.id().to_string();
        let deadline = Duration::from_millis(self.limits.unit_timeout_ms);
        let result = tokio::time::timeout(deadline, self.interact(&mut session, query)).await;
        session.close().await;

        let mut report = match result {
            Ok(Ok(done)) => {
                let mut report = self.extract(&done.outcome, query);
                report.attempts = done.attempts;
                report.validation = done.validation;
                report
            }
            Ok(Err((e, attempts))) => UnitReport {
                attempts,
                ..UnitReport::failed(&self.site, query, e)
            },
            Err(_) => UnitReport::failed(
                &self.site,
                query,
                HarvestError::Session {
                    site: self.site.to_string(),
                    message: format!("unit exceeded {}ms", self.limits.unit_timeout_ms),
                },
            ),
        };
        report.session_id = Some(session_id);
        report
    }

    async fn interact(
        &self,
        session: &mut DiscoverySession,
        query: &str,
    ) -> Result<Interacted, (HarvestError, u32)> {
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            let config = self.config();
            let executor = InteractionExecutor::new(&config, self.engine.inference())
                .with_navigation_timeout(self.limits.navigation_timeout_ms)
                .with_poll_interval(self.limits.poll_interval_ms);
            let retries_left = attempts <= self.limits.max_query_retries;

            match executor.run(session.context(), &self.entry_url, query).await {
                Ok(outcome) if outcome.timed_out && retries_left => {
                    tracing::info!(site = %self.site, query, attempts, "no results yet, retrying");
                }
                Ok(outcome) => break outcome,
                Err(e) if e.is_retryable() && retries_left => {
                    tracing::info!(site = %self.site, query, attempts, "retrying: {e}");
                }
                Err(e) => return Err((e, attempts)),
            }
        };

        let mut validation = None;
        if outcome.submitted && self.validator.try_claim() {
            let _claim = ClaimGuard(&self.validator);
            let config = self.config();
            let result = validate(&self.engine, &config, &outcome)
                .await
                .map_err(|e| (e, attempts))?;
            let status = self.validator.finish(&result);
            let rediscovered = result.refined_layer.is_some();
            if let Some(layer) = &result.refined_layer {
                self.results_discovered.store(true, Ordering::Release);
                self.refresh_config();
                self.emitter.emit(HarvestEventKind::DiscoveryAdvanced {
                    site: self.site.to_string(),
                    state: DiscoveryState::ResultsDiscovered,
                    confidence: layer.confidence.unwrap_or(0.0),
                });
            }
            if status == ValidationStatus::Degraded {
                tracing::warn!(site = %self.site, "validation failed: {}", result.reason);
            } else {
                tracing::info!(site = %self.site, "validation passed: {}", result.reason);
            }
            self.emitter.emit(HarvestEventKind::ValidationFinished {
                site: self.site.to_string(),
                status: status.as_str().to_string(),
                rediscovered,
            });
            validation = Some(status);
        }

        Ok(Interacted {
            outcome,
            attempts,
            validation,
        })
    }

    /// Extract, persist and classify.
    fn extract(&self, outcome: &InteractionOutcome, query: &str) -> UnitReport {
        let config = self.config();
        let extraction = extract_snapshots(
            &outcome.snapshots,
            &config,
            &RecordContext {
                site: self.site.to_string(),
                source_url: outcome.final_url.clone(),
                query: query.to_string(),
                flag: self.validator.flag(),
            },
        );

        if extraction.cards == 0 {
            return UnitReport {
                status: UnitStatus::Empty,
                ..UnitReport::failed(
                    &self.site,
                    query,
                    HarvestError::InteractionTimeout {
                        site: self.site.to_string(),
                        query: query.to_string(),
                        waited_ms: outcome.waited_ms,
                    },
                )
            };
        }

        if let Err(e) = self.sink.append(&extraction.records) {
            tracing::warn!(site = %self.site, query, "failed to persist records: {e:#}");
        }
        let (status, error) = if extraction.empty_cards == extraction.cards {
            let error = HarvestError::ExtractionEmpty {
                site: self.site.to_string(),
                cards: extraction.cards,
            };
            (UnitStatus::Empty, Some(error))
        } else {
            (UnitStatus::Succeeded, None)
        };
        UnitReport {
            error,
            records: extraction.records,
            ..UnitReport::new(&self.site, query, status)
        }
    }

    fn emit_report(&self, report: &UnitReport) {
        match (&report.error, report.status) {
            (Some(e), UnitStatus::Failed | UnitStatus::Empty) => {
                tracing::warn!(site = %self.site, query = %report.query, kind = e.kind(), "unit did not produce records: {e}");
                self.emitter.emit(HarvestEventKind::UnitFailed {
                    site: self.site.to_string(),
                    query: report.query.clone(),
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                });
            }
            _ => {
                tracing::info!(
                    site = %self.site,
                    query = %report.query,
                    records = report.records.len(),
                    "unit completed"
                );
                self.emitter.emit(HarvestEventKind::UnitCompleted {
                    site: self.site.to_string(),
                    query: report.query.clone(),
                    records: report.records.len(),
                    attempts: report.attempts,
                    elapsed_ms: report.elapsed_ms,
                });
            }
        }
    }
}
