//! Offline worker configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use url::Url;

use crate::{PwaError, Result};

/// Cache bucket name for the current deployment.
pub const DEFAULT_CACHE_NAME: &str = "smrps-pwa-v1";

/// Page served when a navigation request cannot reach the network.
pub const DEFAULT_OFFLINE_URL: &str = "/offline/";

/// Offline worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OfflineConfig {
    /// Origin the worker is deployed on; relative URLs resolve against it
    pub origin: Url,

    /// Path the worker script is served from
    pub script: String,

    /// Name of the single cache bucket; changing it retires older buckets
    pub cache_name: String,

    /// Fallback page for failed navigations
    pub offline_url: String,

    /// Assets fetched and stored at install time
    pub precache: Vec<String>,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:8000/").expect("static origin is valid"),
            script: "/sw.js".to_string(),
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            offline_url: DEFAULT_OFFLINE_URL.to_string(),
            precache: vec![
                DEFAULT_OFFLINE_URL.to_string(),
                "/static/logo1.png".to_string(),
                "/static/background.jpg".to_string(),
            ],
        }
    }
}

impl OfflineConfig {
    /// Default configuration for a given origin.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            PwaError::config_with_source(format!("reading {}", path.display()), e)
        })?;
        Self::from_json_str(&json)
    }

    /// Check the fields that can't be expressed in the type.
    pub fn validate(&self) -> Result<()> {
        if self.cache_name.trim().is_empty() {
            return Err(PwaError::config("cache_name must not be empty"));
        }
        if self.origin.cannot_be_a_base() {
            return Err(PwaError::config(format!(
                "origin {} cannot resolve relative URLs",
                self.origin
            )));
        }
        self.script_url()?;
        self.offline_page()?;
        self.precache_urls()?;
        Ok(())
    }

    /// Resolve a possibly-relative URL against the origin.
    pub fn resolve(&self, url: &str) -> Result<Url> {
        Ok(self.origin.join(url)?)
    }

    /// Absolute URL of the worker script.
    pub fn script_url(&self) -> Result<Url> {
        self.resolve(&self.script)
    }

    /// Absolute URL of the offline fallback page.
    pub fn offline_page(&self) -> Result<Url> {
        self.resolve(&self.offline_url)
    }

    /// Absolute precache URLs, in order, with duplicates removed.
    ///
    /// The offline page is always included even if the list omits it.
    pub fn precache_urls(&self) -> Result<Vec<Url>> {
        let mut urls: Vec<Url> = Vec::with_capacity(self.precache.len() + 1);
        for raw in &self.precache {
            let url = self.resolve(raw)?;
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        let offline = self.offline_page()?;
        if !urls.contains(&offline) {
            urls.insert(0, offline);
        }
        Ok(urls)
    }
}
