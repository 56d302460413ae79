//! Browser-session collaborator.
//!
//! Defines the `Renderer` and `RenderContext` traits that abstract over the
//! browser engine (currently Chromium via chromiumoxide). Element-level
//! operations (`fill`, `click`, `count`, ...) have default implementations
//! built on `execute_js`, so an engine only needs navigation, script
//! evaluation and HTML capture.

pub mod chromium;
pub mod scripts;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of navigating to a URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationResult {
    /// The final URL after any redirects.
    pub final_url: String,
    /// HTTP status code.
    pub status: u16,
    /// Time taken to load the page in milliseconds.
    pub load_time_ms: u64,
}

/// A browser engine that can create rendering contexts.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Create a new browser context (tab).
    async fn new_context(&self) -> Result<Box<dyn RenderContext>>;
    /// Shut down the browser engine.
    async fn shutdown(&self) -> Result<()>;
    /// Number of currently active contexts.
    fn active_contexts(&self) -> usize;
}

/// Launches fresh renderers; workers call it again when recycling.
#[async_trait]
pub trait RendererFactory: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Renderer>>;
}

/// A single browser context (tab).
#[async_trait]
pub trait RenderContext: Send + Sync {
    /// Navigate to a URL with a timeout.
    async fn navigate(&mut self, url: &str, timeout_ms: u64) -> Result<NavigationResult>;
    /// Execute JavaScript in the page context and return the result.
    async fn execute_js(&self, script: &str) -> Result<serde_json::Value>;
    /// Get the full page HTML.
    async fn get_html(&self) -> Result<String>;
    /// Get the current URL.
    async fn get_url(&self) -> Result<String>;
    /// Close this context.
    async fn close(self: Box<Self>) -> Result<()>;

    /// Fill the first element matching `css` (and `text`, if given).
    async fn fill(&self, css: &str, text: Option<&str>, value: &str) -> Result<bool> {
        let result = self.execute_js(&scripts::fill(css, text, value)).await?;
        Ok(scripts::reported_success(&result))
    }

    /// Click the first visible element matching `css` / `text`.
    async fn click(&self, css: &str, text: Option<&str>) -> Result<bool> {
        let result = self.execute_js(&scripts::click(css, text)).await?;
        Ok(scripts::reported_success(&result))
    }

    /// Press a key on a matching element, or on the focused element.
    async fn press_key(&self, css: Option<&str>, key: &str) -> Result<bool> {
        let result = self.execute_js(&scripts::press_key(css, key)).await?;
        Ok(scripts::reported_success(&result))
    }

    /// Number of live elements matching `css` / `text`.
    async fn count(&self, css: &str, text: Option<&str>) -> Result<usize> {
        let result = self.execute_js(&scripts::count(css, text)).await?;
        Ok(result.as_u64().unwrap_or(0) as usize)
    }

    /// Scroll the window, or a container, to the bottom.
    async fn scroll_to_bottom(&self, container: Option<&str>) -> Result<()> {
        self.execute_js(&scripts::scroll_to_bottom(container)).await?;
        Ok(())
    }

    /// Poll until at least one element matches, or `timeout_ms` elapses.
    ///
    /// Returns `Ok(false)` on timeout; a timeout is not an error.
    async fn wait_for_selector(
        &self,
        css: &str,
        text: Option<&str>,
        timeout_ms: u64,
        poll_ms: u64,
    ) -> Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.count(css, text).await? > 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(poll_ms.max(10))).await;
        }
    }
}

/// A no-op renderer used when Chromium is unavailable.
///
/// Every session open fails, so harvest units report a session error
/// while discovery over plain HTTP keeps working.
pub struct NoopRenderer;

#[async_trait]
impl Renderer for NoopRenderer {
    async fn new_context(&self) -> Result<Box<dyn RenderContext>> {
        Err(anyhow::anyhow!("browser not available"))
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
    fn active_contexts(&self) -> usize {
        0
    }
}
