//! Error taxonomy for harvest units.
//!
//! Errors at or below a (site, query-key) unit are caught by the harvest
//! loop and reported; only [`HarvestError::ConfigMissing`] and
//! [`HarvestError::Store`] are allowed to abort a whole site.

use crate::config::{ConfigError, Role};
use crate::inference::InferenceError;
use thiserror::Error;

/// Errors surfaced by discovery, interaction and extraction.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// No usable selector for a required role at any config layer.
    #[error("no selector for required role `{role}` on {site}")]
    ConfigMissing { site: String, role: Role },

    /// Inference failed or returned unparseable output.
    #[error("discovery failed for {site}: {reason}")]
    DiscoveryFailed { site: String, reason: String },

    /// Result cards never appeared within the wait bound.
    #[error("no result cards for {site} / {query} within {waited_ms}ms")]
    InteractionTimeout {
        site: String,
        query: String,
        waited_ms: u64,
    },

    /// Cards were present but none of the data fields matched.
    #[error("{cards} card(s) on {site} produced no field values")]
    ExtractionEmpty { site: String, cards: usize },

    /// Browser-session failure; aborts only the current unit.
    #[error("session error on {site}: {message}")]
    Session { site: String, message: String },

    /// Config store corruption or I/O failure.
    #[error("config store error: {0}")]
    Store(String),
}

impl HarvestError {
    /// Wrap a browser-level `anyhow` error.
    pub fn session(site: &str, err: anyhow::Error) -> Self {
        Self::Session {
            site: site.to_string(),
            message: format!("{err:#}"),
        }
    }

    /// Whether this error may be retried at the query-key level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::InteractionTimeout { .. })
    }

    /// Whether this error aborts the whole site rather than one unit.
    pub fn is_site_fatal(&self) -> bool {
        matches!(self, Self::ConfigMissing { .. } | Self::Store(_))
    }

    /// Short machine-friendly label used in reports and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigMissing { .. } => "config_missing",
            Self::DiscoveryFailed { .. } => "discovery_failed",
            Self::InteractionTimeout { .. } => "interaction_timeout",
            Self::ExtractionEmpty { .. } => "extraction_empty",
            Self::Session { .. } => "session_error",
            Self::Store(_) => "store",
        }
    }
}

impl From<ConfigError> for HarvestError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Missing { site, role } => Self::ConfigMissing { site, role },
            other => Self::Store(other.to_string()),
        }
    }
}

impl HarvestError {
    /// Convert an inference failure into a non-fatal discovery failure.
    pub fn discovery(site: &str, err: &InferenceError) -> Self {
        Self::DiscoveryFailed {
            site: site.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Convenience alias.
pub type HarvestResult<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let timeout = HarvestError::InteractionTimeout {
            site: "a.com".into(),
            query: "10001".into(),
            waited_ms: 100,
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_site_fatal());

        let missing = HarvestError::ConfigMissing {
            site: "a.com".into(),
            role: Role::ResultCard,
        };
        assert!(missing.is_site_fatal());
        assert_eq!(missing.kind(), "config_missing");
        assert_eq!(
            missing.to_string(),
            "no selector for required role `result_card` on a.com"
        );
    }

    #[test]
    fn test_from_config_error() {
        let err: HarvestError = ConfigError::Missing {
            site: "b.com".into(),
            role: Role::SearchInput,
        }
        .into();
        assert!(matches!(err, HarvestError::ConfigMissing { .. }));
    }
}
