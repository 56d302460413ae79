//! Test doubles for the collaborator traits.
//!
//! Shared by unit tests and `runtime/tests/`. Every double is `Clone` and
//! keeps its state behind an `Arc`, so a test can hand one copy to the code
//! under test and inspect calls through another.

use crate::extraction::candidate::element_text;
use crate::fetch::{visible_text, ContentFetcher, FetchedContent};
use crate::inference::{Inference, InferenceError, InferenceRequest, InferenceTask, ModelTier};
use crate::output::RecordSink;
use crate::records::ResultRecord;
use crate::renderer::{NavigationResult, RenderContext, Renderer, RendererFactory};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Mock inference
// =============================================================================

#[derive(Default)]
struct InferenceScript {
    once: HashMap<InferenceTask, VecDeque<Result<String, String>>>,
    sticky: HashMap<InferenceTask, Result<String, String>>,
    calls: Vec<InferenceRequest>,
}

/// Canned responses per task. Queued one-shot responses are used first,
/// then the sticky response; a task with neither fails as `Disabled`.
#[derive(Clone, Default)]
pub struct MockInference {
    script: Arc<Mutex<InferenceScript>>,
}

impl MockInference {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every call for `task` with `text`.
    pub fn respond(self, task: InferenceTask, text: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .sticky
            .insert(task, Ok(text.to_string()));
        self
    }

    /// Answer the next call for `task` with `text`.
    pub fn respond_once(self, task: InferenceTask, text: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .once
            .entry(task)
            .or_default()
            .push_back(Ok(text.to_string()));
        self
    }

    /// Fail every call for `task` with a transport error.
    pub fn fail(self, task: InferenceTask, message: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .sticky
            .insert(task, Err(message.to_string()));
        self
    }

    /// Number of calls made for `task`.
    pub fn calls(&self, task: InferenceTask) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|r| r.task == task)
            .count()
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.script.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl Inference for MockInference {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(request.clone());
        let queued = script.once.get_mut(&request.task).and_then(VecDeque::pop_front);
        let answer = match queued {
            Some(answer) => answer,
            None => match script.sticky.get(&request.task) {
                Some(answer) => answer.clone(),
                None => return Err(InferenceError::Disabled),
            },
        };
        answer.map_err(InferenceError::Transport)
    }

    fn model_name(&self, tier: ModelTier) -> String {
        match tier {
            ModelTier::Standard => "mock".to_string(),
            ModelTier::Fast => "mock-fast".to_string(),
        }
    }
}

// =============================================================================
// Mock fetcher
// =============================================================================

/// Serves fixed HTML per URL over the fetch collaborator.
#[derive(Clone, Default)]
pub struct MockFetcher {
    pages: Arc<Mutex<HashMap<String, String>>>,
    fetched: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, html: &str) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(url.to_string(), html.to_string());
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedContent> {
        self.fetched.lock().unwrap().push(url.to_string());
        let html = self
            .pages
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("HTTP 404 fetching {url}"))?;
        Ok(FetchedContent {
            url: url.to_string(),
            final_url: url.to_string(),
            text: visible_text(&html),
            html,
            screenshot: None,
        })
    }
}

// =============================================================================
// Scripted browser
// =============================================================================

/// Page events a script can react to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trigger {
    Click(String),
    Enter,
    Escape,
    Scroll,
}

/// One action performed through a fake context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageAction {
    Navigate(String),
    Fill { css: String, value: String },
    Click(String),
    Key(String),
    Scroll,
}

/// An action and the page it happened on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedAction {
    pub page: String,
    pub action: PageAction,
}

#[derive(Default)]
struct SiteScript {
    pages: HashMap<String, String>,
    reactions: HashMap<(String, Trigger), Vec<String>>,
    slow_pages: HashMap<String, u64>,
    failing_pages: HashSet<String>,
    actions: Vec<LoggedAction>,
    launches: usize,
    shutdowns: usize,
    opened: usize,
    closed: usize,
}

/// A scripted set of pages shared by every fake renderer and context.
///
/// Pages are keyed by URL. Reactions are keyed by the URL last navigated
/// to and a [`Trigger`]; each firing within one context advances to the
/// next HTML state and stays on the last one.
#[derive(Clone, Default)]
pub struct ScriptedSite {
    script: Arc<Mutex<SiteScript>>,
}

impl ScriptedSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, url: &str, html: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .pages
            .insert(url.to_string(), html.to_string());
        self
    }

    /// Replace the DOM when `css` is clicked on `url`.
    pub fn on_click(self, url: &str, css: &str, html: &str) -> Self {
        self.on(url, Trigger::Click(css.to_string()), vec![html.to_string()])
    }

    /// Successive DOM states for repeated clicks on `css`.
    pub fn on_click_sequence(self, url: &str, css: &str, states: Vec<String>) -> Self {
        self.on(url, Trigger::Click(css.to_string()), states)
    }

    pub fn on_enter(self, url: &str, html: &str) -> Self {
        self.on(url, Trigger::Enter, vec![html.to_string()])
    }

    pub fn on_escape(self, url: &str, html: &str) -> Self {
        self.on(url, Trigger::Escape, vec![html.to_string()])
    }

    pub fn on_scroll(self, url: &str, states: Vec<String>) -> Self {
        self.on(url, Trigger::Scroll, states)
    }

    pub fn on(self, url: &str, trigger: Trigger, states: Vec<String>) -> Self {
        self.script
            .lock()
            .unwrap()
            .reactions
            .insert((url.to_string(), trigger), states);
        self
    }

    /// Delay navigation to `url` by `delay_ms`.
    pub fn slow(self, url: &str, delay_ms: u64) -> Self {
        self.script
            .lock()
            .unwrap()
            .slow_pages
            .insert(url.to_string(), delay_ms);
        self
    }

    /// Make navigation to `url` fail.
    pub fn failing(self, url: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .failing_pages
            .insert(url.to_string());
        self
    }

    pub fn actions(&self) -> Vec<LoggedAction> {
        self.script.lock().unwrap().actions.clone()
    }

    pub fn fills(&self) -> Vec<(String, String)> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a.action {
                PageAction::Fill { css, value } => Some((css, value)),
                _ => None,
            })
            .collect()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a.action {
                PageAction::Click(css) => Some(css),
                _ => None,
            })
            .collect()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.actions()
            .into_iter()
            .filter_map(|a| match a.action {
                PageAction::Navigate(url) => Some(url),
                _ => None,
            })
            .collect()
    }

    pub fn launches(&self) -> usize {
        self.script.lock().unwrap().launches
    }

    pub fn shutdowns(&self) -> usize {
        self.script.lock().unwrap().shutdowns
    }

    pub fn contexts_opened(&self) -> usize {
        self.script.lock().unwrap().opened
    }

    pub fn contexts_closed(&self) -> usize {
        self.script.lock().unwrap().closed
    }

    fn log(&self, page: &str, action: PageAction) {
        self.script.lock().unwrap().actions.push(LoggedAction {
            page: page.to_string(),
            action,
        });
    }

    fn reaction(&self, url: &str, trigger: &Trigger, firing: usize) -> Option<String> {
        let script = self.script.lock().unwrap();
        let states = script.reactions.get(&(url.to_string(), trigger.clone()))?;
        states.get(firing.min(states.len().saturating_sub(1))).cloned()
    }
}

/// Renderer over a [`ScriptedSite`].
pub struct FakeRenderer {
    site: ScriptedSite,
}

impl FakeRenderer {
    pub fn new(site: ScriptedSite) -> Self {
        Self { site }
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn new_context(&self) -> Result<Box<dyn RenderContext>> {
        self.site.script.lock().unwrap().opened += 1;
        Ok(Box::new(FakePage {
            site: self.site.clone(),
            url: String::new(),
            html: Mutex::new(String::new()),
            fired: Mutex::new(HashMap::new()),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        self.site.script.lock().unwrap().shutdowns += 1;
        Ok(())
    }

    fn active_contexts(&self) -> usize {
        let script = self.site.script.lock().unwrap();
        script.opened.saturating_sub(script.closed)
    }
}

/// Launches [`FakeRenderer`]s and counts launches.
#[derive(Clone)]
pub struct FakeFactory {
    site: ScriptedSite,
}

impl FakeFactory {
    pub fn new(site: ScriptedSite) -> Self {
        Self { site }
    }
}

#[async_trait]
impl RendererFactory for FakeFactory {
    async fn launch(&self) -> Result<Arc<dyn Renderer>> {
        self.site.script.lock().unwrap().launches += 1;
        Ok(Arc::new(FakeRenderer::new(self.site.clone())))
    }
}

/// A context whose DOM is a string swapped by scripted reactions.
///
/// Element operations match against the current HTML with `scraper`.
/// Visibility is not modelled.
pub struct FakePage {
    site: ScriptedSite,
    url: String,
    html: Mutex<String>,
    fired: Mutex<HashMap<Trigger, usize>>,
}

impl FakePage {
    fn current_html(&self) -> String {
        self.html.lock().unwrap().clone()
    }

    fn matches(&self, css: &str, text: Option<&str>) -> usize {
        let Ok(selector) = Selector::parse(css) else {
            return 0;
        };
        let doc = Html::parse_document(&self.current_html());
        let needle = text.map(str::to_lowercase);
        doc.select(&selector)
            .filter(|el| match &needle {
                Some(n) => element_text(el).to_lowercase().contains(n.as_str()),
                None => true,
            })
            .count()
    }

    fn fire(&self, trigger: Trigger) {
        let firing = {
            let mut fired = self.fired.lock().unwrap();
            let count = fired.entry(trigger.clone()).or_insert(0);
            let firing = *count;
            *count += 1;
            firing
        };
        if let Some(next) = self.site.reaction(&self.url, &trigger, firing) {
            *self.html.lock().unwrap() = next;
        }
    }
}

#[async_trait]
impl RenderContext for FakePage {
    async fn navigate(&mut self, url: &str, _timeout_ms: u64) -> Result<NavigationResult> {
        self.site.log(url, PageAction::Navigate(url.to_string()));
        let (delay, failing, page) = {
            let script = self.site.script.lock().unwrap();
            (
                script.slow_pages.get(url).copied(),
                script.failing_pages.contains(url),
                script.pages.get(url).cloned(),
            )
        };
        if let Some(ms) = delay {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if failing {
            return Err(anyhow!("navigation failed: net::ERR_CONNECTION_RESET"));
        }
        let html = page.ok_or_else(|| anyhow!("navigation failed: no page at {url}"))?;
        self.url = url.to_string();
        *self.html.get_mut().unwrap() = html;
        self.fired.get_mut().unwrap().clear();
        Ok(NavigationResult {
            final_url: url.to_string(),
            status: 200,
            load_time_ms: 0,
        })
    }

    async fn execute_js(&self, _script: &str) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn get_html(&self) -> Result<String> {
        Ok(self.current_html())
    }

    async fn get_url(&self) -> Result<String> {
        Ok(self.url.clone())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.site.script.lock().unwrap().closed += 1;
        Ok(())
    }

    async fn fill(&self, css: &str, text: Option<&str>, value: &str) -> Result<bool> {
        if self.matches(css, text) == 0 {
            return Ok(false);
        }
        self.site.log(
            &self.url,
            PageAction::Fill {
                css: css.to_string(),
                value: value.to_string(),
            },
        );
        Ok(true)
    }

    async fn click(&self, css: &str, text: Option<&str>) -> Result<bool> {
        if self.matches(css, text) == 0 {
            return Ok(false);
        }
        self.site.log(&self.url, PageAction::Click(css.to_string()));
        self.fire(Trigger::Click(css.to_string()));
        Ok(true)
    }

    async fn press_key(&self, css: Option<&str>, key: &str) -> Result<bool> {
        if let Some(css) = css {
            if self.matches(css, None) == 0 {
                return Ok(false);
            }
        }
        self.site.log(&self.url, PageAction::Key(key.to_string()));
        match key {
            "Enter" => self.fire(Trigger::Enter),
            "Escape" => self.fire(Trigger::Escape),
            _ => {}
        }
        Ok(true)
    }

    async fn count(&self, css: &str, text: Option<&str>) -> Result<usize> {
        Ok(self.matches(css, text))
    }

    async fn scroll_to_bottom(&self, _container: Option<&str>) -> Result<()> {
        self.site.log(&self.url, PageAction::Scroll);
        self.fire(Trigger::Scroll);
        Ok(())
    }
}

// =============================================================================
// Memory sink
// =============================================================================

/// Collects appended records in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ResultRecord>>>,
    finished: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ResultRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Sites passed to `finish_site`, in call order.
    pub fn finished_sites(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }
}

impl RecordSink for MemorySink {
    fn append(&self, records: &[ResultRecord]) -> Result<()> {
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    fn finish_site(&self, site: &str) -> Result<()> {
        self.finished.lock().unwrap().push(site.to_string());
        Ok(())
    }
}
