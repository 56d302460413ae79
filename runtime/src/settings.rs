//! Run settings: pool sizes, timeouts, retry caps and collaborator endpoints.
//!
//! Built from CLI flags, then environment overrides, then validated.

use crate::config::{store::default_root, DiscoveredMergePolicy};
use crate::inference::ollama;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub const ENV_LLM_ENDPOINT: &str = "LOCATOR_LLM_ENDPOINT";
pub const ENV_LLM_MODEL: &str = "LOCATOR_LLM_MODEL";
pub const ENV_LLM_FAST_MODEL: &str = "LOCATOR_LLM_FAST_MODEL";
pub const ENV_LLM_TIMEOUT: &str = "LOCATOR_LLM_TIMEOUT";
pub const ENV_CHROMIUM_PATH: &str = "LOCATOR_CHROMIUM_PATH";
pub const ENV_READER_ENDPOINT: &str = "LOCATOR_READER_ENDPOINT";

/// Problems found by [`HarvestSettings::validate`].
#[derive(Debug, Error)]
#[error("invalid settings:\n  - {}", .problems.join("\n  - "))]
pub struct SettingsError {
    pub problems: Vec<String>,
}

/// Inference endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSettings {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    /// Model for the page-state check; the standard model when unset.
    pub fast_model: Option<String>,
    pub timeout_ms: u64,
    pub temperature: f32,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: ollama::DEFAULT_ENDPOINT.to_string(),
            model: ollama::DEFAULT_MODEL.to_string(),
            fast_model: None,
            timeout_ms: ollama::DEFAULT_TIMEOUT_MS,
            temperature: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestSettings {
    /// Sites processed concurrently.
    pub site_concurrency: usize,
    /// Query workers per site, each with its own browser.
    pub workers_per_site: usize,
    /// Units a worker runs before relaunching its browser.
    pub recycle_after: u32,
    /// Extra attempts for a unit whose results never appeared.
    pub max_query_retries: u32,
    /// Hard bound on one (site, query) unit, session close included.
    pub unit_timeout_ms: u64,
    pub navigation_timeout_ms: u64,
    /// Result-card polling interval.
    pub poll_interval_ms: u64,
    /// Consecutive unit failures before a worker pauses.
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub fetch_timeout_ms: u64,
    pub discovery_enabled: bool,
    pub validation_enabled: bool,
    pub headless: bool,
    pub chromium_path: Option<PathBuf>,
    pub reader_endpoint: Option<String>,
    pub output_dir: PathBuf,
    pub config_dir: PathBuf,
    pub merge_policy: DiscoveredMergePolicy,
    pub inference: InferenceSettings,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            site_concurrency: 2,
            workers_per_site: 1,
            recycle_after: 25,
            max_query_retries: 1,
            unit_timeout_ms: 180_000,
            navigation_timeout_ms: 30_000,
            poll_interval_ms: 500,
            failure_threshold: 5,
            cooldown_ms: 30_000,
            fetch_timeout_ms: 20_000,
            discovery_enabled: true,
            validation_enabled: true,
            headless: true,
            chromium_path: None,
            reader_endpoint: None,
            output_dir: PathBuf::from("output"),
            config_dir: default_root(),
            merge_policy: DiscoveredMergePolicy::default(),
            inference: InferenceSettings::default(),
        }
    }
}

impl HarvestSettings {
    /// Apply `LOCATOR_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), SettingsError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut problems = Vec::new();

        if let Some(v) = get(ENV_LLM_ENDPOINT) {
            self.inference.endpoint = v;
        }
        if let Some(v) = get(ENV_LLM_MODEL) {
            self.inference.model = v;
        }
        if let Some(v) = get(ENV_LLM_FAST_MODEL) {
            self.inference.fast_model = Some(v);
        }
        if let Some(v) = get(ENV_LLM_TIMEOUT) {
            match parse_duration_ms(&v) {
                Some(ms) => self.inference.timeout_ms = ms,
                None => problems.push(format!("{ENV_LLM_TIMEOUT}: not a duration: {v:?}")),
            }
        }
        if let Some(v) = get(ENV_CHROMIUM_PATH) {
            self.chromium_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get(ENV_READER_ENDPOINT) {
            self.reader_endpoint = Some(v);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SettingsError { problems })
        }
    }

    /// Check every setting and report all problems at once.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut problems = Vec::new();
        if self.site_concurrency == 0 {
            problems.push("site concurrency must be at least 1".to_string());
        }
        if self.workers_per_site == 0 {
            problems.push("workers per site must be at least 1".to_string());
        }
        if self.recycle_after == 0 {
            problems.push("recycle interval must be at least 1 unit".to_string());
        }
        if self.failure_threshold == 0 {
            problems.push("failure threshold must be at least 1".to_string());
        }
        for (name, value) in [
            ("unit timeout", self.unit_timeout_ms),
            ("navigation timeout", self.navigation_timeout_ms),
            ("poll interval", self.poll_interval_ms),
            ("fetch timeout", self.fetch_timeout_ms),
            ("inference timeout", self.inference.timeout_ms),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be greater than 0"));
            }
        }
        if self.inference.enabled {
            if let Err(e) = url::Url::parse(&self.inference.endpoint) {
                problems.push(format!(
                    "inference endpoint {:?} is not a URL: {e}",
                    self.inference.endpoint
                ));
            }
            if self.inference.model.trim().is_empty() {
                problems.push("inference model is empty".to_string());
            }
        }
        if !(0.0..=2.0).contains(&self.inference.temperature) {
            problems.push("temperature must be within 0.0-2.0".to_string());
        }
        if let Some(reader) = &self.reader_endpoint {
            if url::Url::parse(reader).is_err() {
                problems.push(format!("reader endpoint {reader:?} is not a URL"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SettingsError { problems })
        }
    }
}

/// Parse `1500`, `1500ms`, `90s` or `2m` into milliseconds. Bare numbers
/// are seconds, matching how inference timeouts are usually written.
pub fn parse_duration_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim().to_ascii_lowercase();
    if let Some(ms) = raw.strip_suffix("ms") {
        return ms.trim().parse().ok();
    }
    if let Some(s) = raw.strip_suffix('s') {
        return s.trim().parse::<u64>().ok().map(|s| s * 1_000);
    }
    if let Some(m) = raw.strip_suffix('m') {
        return m.trim().parse::<u64>().ok().map(|m| m * 60_000);
    }
    raw.parse::<u64>().ok().map(|s| s * 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        HarvestSettings::default().validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_LLM_ENDPOINT, "http://gpu-box:11434"),
            (ENV_LLM_MODEL, "qwen2.5:7b"),
            (ENV_LLM_FAST_MODEL, "qwen2.5:1.5b"),
            (ENV_LLM_TIMEOUT, "45"),
            (ENV_READER_ENDPOINT, "  "),
        ]
        .into_iter()
        .collect();
        let mut settings = HarvestSettings::default();
        settings
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.inference.endpoint, "http://gpu-box:11434");
        assert_eq!(settings.inference.model, "qwen2.5:7b");
        assert_eq!(settings.inference.fast_model.as_deref(), Some("qwen2.5:1.5b"));
        assert_eq!(settings.inference.timeout_ms, 45_000);
        assert_eq!(settings.reader_endpoint, None);
    }

    #[test]
    fn test_bad_env_timeout_reported() {
        let mut settings = HarvestSettings::default();
        let err = settings
            .apply_overrides(|k| (k == ENV_LLM_TIMEOUT).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_LLM_TIMEOUT));
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let settings = HarvestSettings {
            site_concurrency: 0,
            workers_per_site: 0,
            unit_timeout_ms: 0,
            inference: InferenceSettings {
                endpoint: "not a url".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = settings.validate().unwrap_err();
        assert_eq!(err.problems.len(), 4);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_ms("1500ms"), Some(1_500));
        assert_eq!(parse_duration_ms("90s"), Some(90_000));
        assert_eq!(parse_duration_ms("2m"), Some(120_000));
        assert_eq!(parse_duration_ms("30"), Some(30_000));
        assert_eq!(parse_duration_ms("x"), None);
    }
}
