//! File-backed config store.
//!
//! ## Layout
//!
//! ```text
//! <root>/base.json                 optional, replaces the embedded base
//! <root>/discovered/<site>.json    written by discovery
//! <root>/overrides/<site>.json     operator-authored, read-only here
//! ```
//!
//! The merged view is recomputed from disk on every `get_merged` call so a
//! write is visible to the next read without any cache invalidation.

use super::{ArrayMerge, ConfigError, ConfigLayer, SiteConfig, SiteId};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Raw JSON of the shipped base layer.
const BASE_CONFIG_JSON: &str = include_str!("base_config.json");

/// Age after which a discovered layer is re-derived.
pub const DISCOVERED_MAX_AGE_DAYS: i64 = 30;

/// What `put_discovered` does with an existing discovered layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveredMergePolicy {
    /// The new layer replaces the old one wholesale.
    #[default]
    Overwrite,
    /// The new layer is overlaid on the old one field by field.
    MergeByField,
}

impl std::str::FromStr for DiscoveredMergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "merge" | "merge_by_field" | "merge-by-field" => Ok(Self::MergeByField),
            other => Err(format!("unknown merge policy `{other}` (overwrite|merge)")),
        }
    }
}

/// Layered config store keyed by [`SiteId`].
pub struct ConfigStore {
    root: PathBuf,
    base: ConfigLayer,
    policy: DiscoveredMergePolicy,
    max_age: TimeDelta,
    locks: DashMap<SiteId, Arc<Mutex<()>>>,
}

impl ConfigStore {
    /// Open (and create) a store rooted at `root`.
    pub fn open(root: PathBuf) -> Result<Self, ConfigError> {
        for dir in [root.clone(), root.join("discovered"), root.join("overrides")] {
            std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        let base_path = root.join("base.json");
        let base = match read_layer(&base_path)? {
            Some(layer) => {
                tracing::debug!("using base layer from {}", base_path.display());
                layer
            }
            None => embedded_base()?,
        };

        Ok(Self {
            root,
            base,
            policy: DiscoveredMergePolicy::default(),
            max_age: TimeDelta::days(DISCOVERED_MAX_AGE_DAYS),
            locks: DashMap::new(),
        })
    }

    /// Default store under `~/.locator-harvest/configs`.
    pub fn default_store() -> Result<Self, ConfigError> {
        Self::open(default_root())
    }

    pub fn with_policy(mut self, policy: DiscoveredMergePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the base layer (used by tests and `--base-config`).
    pub fn with_base(mut self, base: ConfigLayer) -> Self {
        self.base = base;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn base(&self) -> &ConfigLayer {
        &self.base
    }

    pub fn policy(&self) -> DiscoveredMergePolicy {
        self.policy
    }

    fn discovered_path(&self, site: &SiteId) -> PathBuf {
        self.root
            .join("discovered")
            .join(format!("{}.json", site.file_stem()))
    }

    fn override_path(&self, site: &SiteId) -> PathBuf {
        self.root
            .join("overrides")
            .join(format!("{}.json", site.file_stem()))
    }

    /// Load the discovered layer, fresh or not.
    pub fn discovered(&self, site: &SiteId) -> Result<Option<ConfigLayer>, ConfigError> {
        read_layer(&self.discovered_path(site))
    }

    /// Load the manual override layer.
    pub fn manual_override(&self, site: &SiteId) -> Result<Option<ConfigLayer>, ConfigError> {
        read_layer(&self.override_path(site))
    }

    /// Whether a discovered layer is younger than the freshness horizon.
    pub fn is_fresh(&self, layer: &ConfigLayer) -> bool {
        self.is_fresh_at(layer, Utc::now())
    }

    fn is_fresh_at(&self, layer: &ConfigLayer, now: DateTime<Utc>) -> bool {
        layer
            .generated_at
            .map(|at| now.signed_duration_since(at) < self.max_age)
            .unwrap_or(false)
    }

    /// Deep-merge base < discovered < manual-override for `site`.
    pub fn get_merged(&self, site: &SiteId) -> Result<SiteConfig, ConfigError> {
        let discovered = self.discovered(site)?;
        let manual = self.manual_override(site)?;
        let stale = discovered
            .as_ref()
            .map(|layer| !self.is_fresh(layer))
            .unwrap_or(false);

        let merged = SiteConfig::merge(
            site.clone(),
            &self.base,
            discovered.as_ref(),
            manual.as_ref(),
            stale,
        );

        if let Some(role) = merged.missing_required_role() {
            return Err(ConfigError::Missing {
                site: site.to_string(),
                role,
            });
        }
        Ok(merged)
    }

    /// Persist a discovered layer atomically and stamp its freshness.
    ///
    /// Concurrent writers for the same site serialize on a per-site lock;
    /// the last writer wins. Returns the layer as written.
    pub async fn put_discovered(
        &self,
        site: &SiteId,
        layer: ConfigLayer,
    ) -> Result<ConfigLayer, ConfigError> {
        let lock = self.site_lock(site);
        let _guard = lock.lock().await;

        let mut to_write = match self.policy {
            DiscoveredMergePolicy::Overwrite => layer,
            DiscoveredMergePolicy::MergeByField => match self.discovered(site)? {
                Some(mut previous) => {
                    previous.overlay(&layer, ArrayMerge::Prepend);
                    previous.confidence = layer.confidence;
                    previous
                }
                None => layer,
            },
        };
        to_write.generated_at = Some(Utc::now());

        let path = self.discovered_path(site);
        let json = serde_json::to_vec_pretty(&to_write).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension(format!("json.tmp-{}", uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|source| ConfigError::Io {
                path: tmp.clone(),
                source,
            })?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ConfigError::Io { path, source });
        }

        tracing::debug!(
            site = %site,
            confidence = to_write.confidence.unwrap_or(0.0),
            "discovered layer written"
        );
        Ok(to_write)
    }

    /// Delete the discovered layer, forcing rediscovery.
    pub fn remove_discovered(&self, site: &SiteId) -> Result<bool, ConfigError> {
        let path = self.discovered_path(site);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ConfigError::Io { path, source }),
        }
    }

    fn site_lock(&self, site: &SiteId) -> Arc<Mutex<()>> {
        self.locks
            .entry(site.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// `~/.locator-harvest/configs`, or `/tmp/.locator-harvest/configs` without a home.
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".locator-harvest")
        .join("configs")
}

/// Parse the embedded base layer.
pub fn embedded_base() -> Result<ConfigLayer, ConfigError> {
    serde_json::from_str(BASE_CONFIG_JSON).map_err(|source| ConfigError::Parse {
        path: PathBuf::from("<embedded base_config.json>"),
        source,
    })
}

fn read_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}
