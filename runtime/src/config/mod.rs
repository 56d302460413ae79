//! Layered per-site configuration.
//!
//! Three layers feed every merged view:
//!
//! 1. **base**: shipped heuristics (embedded JSON, optionally replaced by
//!    `<root>/base.json`),
//! 2. **discovered**: written by the discovery engine, one file per site,
//! 3. **manual override**: operator-authored, never written by this crate.

pub mod layer;
pub mod store;

pub use layer::{
    ArrayMerge, ConfigLayer, FieldRule, FieldRuleLayer, InteractionLayer, InteractionParams,
    LayerPresence, PaginationMode, Role, SiteConfig, SubmitStrategy, ValueKind,
};
pub use store::{ConfigStore, DiscoveredMergePolicy};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the config store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no selector for required role `{role}` on {site}")]
    Missing { site: String, role: Role },

    #[error("cannot derive a site identity from `{0}`")]
    InvalidSite(String),

    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config layer {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Canonical site key: lowercased host without a leading `www.`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    /// Build from an already-canonical host string.
    pub fn new(host: &str) -> Self {
        let host = host.trim().to_ascii_lowercase();
        Self(host.strip_prefix("www.").unwrap_or(&host).to_string())
    }

    /// Derive the identity from a URL or a bare host.
    pub fn from_url(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };
        let parsed =
            url::Url::parse(&with_scheme).map_err(|_| ConfigError::InvalidSite(raw.to_string()))?;
        match parsed.host_str() {
            Some(host) if !host.is_empty() => Ok(Self::new(host)),
            _ => Err(ConfigError::InvalidSite(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe stem (`dealers.example.com` -> `dealers_example_com`).
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
