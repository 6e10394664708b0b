//! Application configuration management.
//!
//! `CacheConfig` is the immutable configuration handed to the lifecycle
//! manager: the current bucket name, the asset list and the application
//! origin. `AppConfig` is its on-disk form, stored at
//! `~/.config/assetcache/config.json`. A missing file means defaults.
//!
//! Bumping `cache_name` is how a new release invalidates every older cache.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConfigError, FetchError};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "assetcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Bucket name for the current release of the application
pub const DEFAULT_CACHE_NAME: &str = "mailcraft-cache-v1";

/// Where the application is served during development
pub const DEFAULT_ORIGIN: &str = "http://127.0.0.1:5000";

/// Assets precached at setup. Relative entries resolve against the origin.
pub const DEFAULT_ASSETS: &[&str] = &[
    "/",
    "/static/manifest.json",
    "/static/css/style.css",
    "/static/icons/icon-192.png",
    "/static/icons/icon-512.png",
    "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/css/bootstrap.min.css",
    "https://unpkg.com/htmx.org@1.9.10",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    cache_name: String,
    assets: Vec<String>,
    origin: Url,
}

impl CacheConfig {
    pub fn new(cache_name: impl Into<String>, assets: Vec<String>, origin: Url) -> Self {
        Self {
            cache_name: cache_name.into(),
            assets,
            origin,
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// True if `name` is the current bucket; every other bucket is stale.
    pub fn is_current(&self, name: &str) -> bool {
        self.cache_name == name
    }

    /// Resolve a path or absolute URL against the origin
    pub fn resolve(&self, target: &str) -> Result<Url, FetchError> {
        Ok(self.origin.join(target)?)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            assets: DEFAULT_ASSETS.iter().map(|s| s.to_string()).collect(),
            origin: Url::parse(DEFAULT_ORIGIN).expect("DEFAULT_ORIGIN is a valid URL"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache_name: String,
    pub assets: Vec<String>,
    pub origin: String,
    pub cache_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            assets: DEFAULT_ASSETS.iter().map(|s| s.to_string()).collect(),
            origin: DEFAULT_ORIGIN.to_string(),
            cache_dir: None,
        }
    }
}

impl AppConfig {
    /// Load from the default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoDirectory("config"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: PathBuf) -> Self {
        self.cache_dir = Some(cache_dir);
        self
    }

    /// Directory holding the on-disk buckets
    pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir().ok_or(ConfigError::NoDirectory("cache"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Validate and freeze into the configuration the worker runs with
    pub fn cache_config(&self) -> Result<CacheConfig, ConfigError> {
        let origin = Url::parse(&self.origin).map_err(|source| ConfigError::InvalidOrigin {
            origin: self.origin.clone(),
            source,
        })?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedOrigin(self.origin.clone()));
        }
        Ok(CacheConfig::new(
            self.cache_name.clone(),
            self.assets.clone(),
            origin,
        ))
    }
}
