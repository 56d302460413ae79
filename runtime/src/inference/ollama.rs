//! Ollama-compatible `/api/generate` client.

use super::{Inference, InferenceError, InferenceRequest, ModelTier};
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use std::time::Duration;

/// Default local endpoint.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:11434";
/// Default model for selector discovery.
pub const DEFAULT_MODEL: &str = "gemma2:2b";
/// Default request timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// HTTP client for an Ollama-style generate endpoint.
#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    fast_model: Option<String>,
    temperature: f32,
    timeout_ms: u64,
}

impl OllamaClient {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            fast_model: None,
            temperature: 0.1,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Use a smaller model for [`ModelTier::Fast`] requests.
    pub fn with_fast_model(mut self, model: impl Into<String>) -> Self {
        self.fast_model = Some(model.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the endpoint answers `/api/tags`.
    pub async fn is_reachable(&self) -> bool {
        let url = format!("{}/api/tags", self.endpoint);
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => self.fast_model.as_deref().unwrap_or(&self.model),
            ModelTier::Standard => &self.model,
        }
    }

    async fn generate(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let mut body = serde_json::json!({
            "model": self.model_for(request.tier),
            "prompt": request.full_prompt(),
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        if !request.images.is_empty() {
            let encoded: Vec<String> = request
                .images
                .iter()
                .map(|img| base64::engine::general_purpose::STANDARD.encode(img))
                .collect();
            body["images"] = serde_json::json!(encoded);
        }

        let url = format!("{}/api/generate", self.endpoint);
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_millis(self.timeout_ms))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout(self.timeout_ms)
                } else {
                    InferenceError::Transport(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status,
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| InferenceError::Schema(e.to_string()))?;
        Ok(parsed.response)
    }
}

#[async_trait]
impl Inference for OllamaClient {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, InferenceError> {
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(self.timeout_ms),
            self.generate(request),
        )
        .await
        .unwrap_or(Err(InferenceError::Timeout(self.timeout_ms)));

        tracing::debug!(
            task = ?request.task,
            model = self.model_for(request.tier),
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "inference call"
        );
        result
    }

    fn model_name(&self, tier: ModelTier) -> String {
        self.model_for(tier).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceTask;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> InferenceRequest {
        InferenceRequest::new(
            InferenceTask::FormSelectors,
            "Find the zip input".into(),
            "<input id=zip>".into(),
        )
    }

    #[tokio::test]
    async fn test_generate_posts_expected_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({
                "model": "big",
                "stream": false,
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "response": "{\"ok\": true}" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri(), "big").with_fast_model("small");
        let text = client.infer(&request()).await.unwrap();
        assert_eq!(text, "{\"ok\": true}");
    }

    #[tokio::test]
    async fn test_fast_tier_uses_fast_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(serde_json::json!({ "model": "small" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "response": "{}" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri(), "big").with_fast_model("small");
        client.infer(&request().fast()).await.unwrap();
        assert_eq!(client.model_name(ModelTier::Fast), "small");
    }

    #[tokio::test]
    async fn test_http_error_is_status_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri(), "big");
        let err = client.infer(&request()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "response": "{}" }))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = OllamaClient::new(server.uri(), "big").with_timeout_ms(50);
        let err = client.infer(&request()).await.unwrap_err();
        assert!(matches!(err, InferenceError::Timeout(50)));
    }
}
