//! Inference collaborator boundary.
//!
//! Discovery talks to a language model only through [`Inference`]. Every
//! failure is an [`InferenceError`] value; callers degrade (lower
//! confidence, heuristic fallback) instead of propagating it.

pub mod ollama;

pub use ollama::OllamaClient;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a request is for. Implementations may route on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceTask {
    LocatorChoice,
    FormSelectors,
    ResultSelectors,
    PageState,
}

/// Model size class. `Fast` serves the page-state check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    #[default]
    Standard,
    Fast,
}

/// One inference call.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub task: InferenceTask,
    pub tier: ModelTier,
    /// Instructions, including the expected JSON shape.
    pub prompt: String,
    /// Page content the instructions refer to.
    pub content: String,
    /// Optional screenshots (PNG bytes) for vision-capable models.
    pub images: Vec<Vec<u8>>,
}

impl InferenceRequest {
    pub fn new(task: InferenceTask, prompt: String, content: String) -> Self {
        Self {
            task,
            tier: ModelTier::Standard,
            prompt,
            content,
            images: Vec::new(),
        }
    }

    pub fn fast(mut self) -> Self {
        self.tier = ModelTier::Fast;
        self
    }

    pub fn with_images(mut self, images: Vec<Vec<u8>>) -> Self {
        self.images = images;
        self
    }

    /// Prompt and content joined the way text-only endpoints expect.
    pub fn full_prompt(&self) -> String {
        if self.content.is_empty() {
            self.prompt.clone()
        } else {
            format!("{}\n\nPage content:\n{}", self.prompt, self.content)
        }
    }
}

/// Failures of the inference collaborator.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference is disabled")]
    Disabled,

    #[error("inference timed out after {0}ms")]
    Timeout(u64),

    #[error("inference transport error: {0}")]
    Transport(String),

    #[error("inference endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("no JSON object in inference response")]
    NoJson,

    #[error("inference response does not match the expected shape: {0}")]
    Schema(String),
}

/// A language-model backend.
#[async_trait]
pub trait Inference: Send + Sync {
    /// Run one request, bounded by the implementation's timeout.
    async fn infer(&self, request: &InferenceRequest) -> Result<String, InferenceError>;

    /// Model name used for a tier, for logs.
    fn model_name(&self, tier: ModelTier) -> String;
}

/// Used when inference is switched off; every call fails fast so
/// discovery falls straight through to heuristics.
pub struct NoopInference;

#[async_trait]
impl Inference for NoopInference {
    async fn infer(&self, _request: &InferenceRequest) -> Result<String, InferenceError> {
        Err(InferenceError::Disabled)
    }

    fn model_name(&self, _tier: ModelTier) -> String {
        "none".to_string()
    }
}

/// Pull the outermost JSON object out of free model text.
///
/// Handles fenced code blocks and prose around the object.
pub fn extract_json_object(text: &str) -> Result<serde_json::Value, InferenceError> {
    let unfenced = strip_code_fences(text);
    let start = unfenced.find('{').ok_or(InferenceError::NoJson)?;
    let end = unfenced.rfind('}').ok_or(InferenceError::NoJson)?;
    if end < start {
        return Err(InferenceError::NoJson);
    }
    serde_json::from_str(&unfenced[start..=end]).map_err(|e| InferenceError::Schema(e.to_string()))
}

/// Parse a model response into `T`.
pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Result<T, InferenceError> {
    let value = extract_json_object(text)?;
    serde_json::from_value(value).map_err(|e| InferenceError::Schema(e.to_string()))
}

fn strip_code_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}
