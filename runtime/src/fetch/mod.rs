//! Content-fetch collaborator.
//!
//! Discovery needs page content in a form a language model can read. The
//! default fetcher GETs the page and reduces the HTML to visible text; when
//! a reader endpoint is configured (a service that renders a URL to
//! markdown when the URL is appended to its base) that text is used instead.

pub mod http_client;

pub use http_client::{HttpClient, HttpResponse};

use anyhow::{bail, Result};
use async_trait::async_trait;
use scraper::{Html, Node};

/// Page content handed to discovery.
#[derive(Debug, Clone, Default)]
pub struct FetchedContent {
    pub url: String,
    pub final_url: String,
    /// Raw HTML; empty when only a reader rendition was available.
    pub html: String,
    /// Model-friendly text.
    pub text: String,
    /// Optional screenshot (PNG).
    pub screenshot: Option<Vec<u8>>,
}

/// Fetches page content for discovery.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedContent>;
}

/// reqwest-backed fetcher with optional reader service.
pub struct HttpContentFetcher {
    client: HttpClient,
    timeout_ms: u64,
    reader_endpoint: Option<String>,
}

impl HttpContentFetcher {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            client: HttpClient::new(timeout_ms),
            timeout_ms,
            reader_endpoint: None,
        }
    }

    /// Route text extraction through a reader service (e.g. `https://r.jina.ai`).
    pub fn with_reader(mut self, endpoint: impl Into<String>) -> Self {
        self.reader_endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    async fn fetch_reader(&self, endpoint: &str, url: &str) -> Result<String> {
        let resp = self
            .client
            .get_with_headers(
                &format!("{endpoint}/{url}"),
                &[("X-Return-Format", "markdown")],
                self.timeout_ms,
            )
            .await?;
        if resp.status >= 400 {
            bail!("reader returned HTTP {} for {url}", resp.status);
        }
        Ok(resp.body)
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedContent> {
        let resp = self.client.get(url, self.timeout_ms).await?;
        if resp.status >= 400 {
            bail!("HTTP {} fetching {url}", resp.status);
        }

        let html = resp.body;
        let mut text = String::new();
        if let Some(endpoint) = &self.reader_endpoint {
            match self.fetch_reader(endpoint, url).await {
                Ok(body) => text = body,
                Err(e) => tracing::warn!("reader fetch failed for {url}, using raw HTML text: {e:#}"),
            }
        }
        if text.trim().is_empty() {
            let source = html.clone();
            text = tokio::task::spawn_blocking(move || visible_text(&source))
                .await
                .unwrap_or_default();
        }

        Ok(FetchedContent {
            url: url.to_string(),
            final_url: resp.final_url,
            html,
            text,
            screenshot: None,
        })
    }
}

/// Visible text of a document, one line per block of text, skipping
/// script/style/noscript/template content.
pub fn visible_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut lines = Vec::new();
    for node in doc.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value().as_element().is_some_and(|el| {
                matches!(el.name(), "script" | "style" | "noscript" | "template" | "svg")
            })
        });
        if hidden {
            continue;
        }
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !collapsed.is_empty() {
            lines.push(collapsed);
        }
    }
    lines.join("\n")
}

/// Truncate to at most `max_chars` characters on a char boundary, marking
/// the cut.
pub fn truncate_for_prompt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("\n\n[... content truncated ...]");
    out
}
