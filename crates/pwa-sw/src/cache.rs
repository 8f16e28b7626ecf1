//! Cache API: named buckets of request URL → stored response.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pwa_common::PwaError;
use pwa_net::{Request, Response, ResponseSource};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::ServiceWorkerError;

/// Snapshot file format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Lookup key for a URL. Fragments never reach the network, so they are
/// not part of the identity.
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.into()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in received order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Capture a response for the given request URL.
    pub fn from_response(url: &Url, method: &Method, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: cache_key(url),
            method: method.as_str().to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Result<Response, ServiceWorkerError> {
        let url = Url::parse(&self.url)
            .map_err(|e| ServiceWorkerError::CacheError(format!("{}: {}", self.url, e)))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(format!("{}: {}", self.url, e)))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(n), Ok(v)) => {
                    headers.append(n, v);
                }
                _ => warn!(url = %self.url, header = %name, "Dropping malformed cached header"),
            }
        }

        Ok(Response::new(url, status, headers, Bytes::from(self.body.clone()))
            .with_source(ResponseSource::Cache))
    }
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ==================== Cache ====================

/// A cache bucket.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries keyed by [`cache_key`].
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request. Only GET requests can match.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if request.method != Method::GET {
            return None;
        }
        self.match_url(&request.url)
    }

    /// Match a URL.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(&cache_key(url))
    }

    /// Store an entry for a URL, replacing any previous one.
    pub fn put(&mut self, url: &Url, entry: CacheEntry) {
        self.entries.insert(cache_key(url), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, url: &Url) -> bool {
        self.entries.remove(&cache_key(url)).is_some()
    }

    /// Get all keys (URLs).
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    caches: Vec<Cache>,
}

/// Cache storage (the `caches` global).
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
    /// Cache names in creation order.
    order: Vec<String>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            debug!(cache = name, "Creating cache");
            self.order.push(name.to_string());
        }
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }

    /// Get all cache names, oldest first.
    pub fn keys(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Match a request across all caches, oldest first.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.ordered().find_map(|cache| cache.match_request(request))
    }

    /// Match a URL across all caches, oldest first.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.ordered().find_map(|cache| cache.match_url(url))
    }

    fn ordered(&self) -> impl Iterator<Item = &Cache> {
        self.order.iter().filter_map(|name| self.caches.get(name))
    }

    /// Write every cache to a JSON snapshot file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> pwa_common::Result<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            caches: self.ordered().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Restore caches from a JSON snapshot file.
    pub fn load_from(path: impl AsRef<Path>) -> pwa_common::Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let snapshot: Snapshot = serde_json::from_str(&json)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(PwaError::InvalidArgument(format!(
                "unsupported cache snapshot version {}",
                snapshot.version
            )));
        }

        let mut storage = Self::new();
        for cache in snapshot.caches {
            if storage.caches.contains_key(&cache.name) {
                return Err(PwaError::InvalidArgument(format!(
                    "cache snapshot names bucket {} twice",
                    cache.name
                )));
            }
            storage.order.push(cache.name.clone());
            storage.caches.insert(cache.name.clone(), cache);
        }
        Ok(storage)
    }

    /// Restore caches from a snapshot file, or start empty if it doesn't exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> pwa_common::Result<Self> {
        if path.as_ref().exists() {
            Self::load_from(path)
        } else {
            Ok(Self::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn entry_for(u: &str, body: &[u8]) -> CacheEntry {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        let response = Response::new(url(u), StatusCode::OK, headers, Bytes::copy_from_slice(body));
        CacheEntry::from_response(&url(u), &Method::GET, &response)
    }

    #[test]
    fn test_cache_match_and_delete() {
        let mut cache = Cache::new("v1");
        let page = url("https://example.com/offline/");
        cache.put(&page, entry_for(page.as_str(), b"offline"));

        assert!(cache.match_url(&page).is_some());
        assert!(cache.match_url(&url("https://example.com/other/")).is_none());

        assert!(cache.delete(&page));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_fragment_ignored() {
        let mut cache = Cache::new("v1");
        let page = url("https://example.com/offline/");
        cache.put(&page, entry_for(page.as_str(), b"offline"));

        assert!(cache.match_url(&url("https://example.com/offline/#top")).is_some());
    }

    #[test]
    fn test_only_get_matches() {
        let mut cache = Cache::new("v1");
        let logo = url("https://example.com/static/logo1.png");
        cache.put(&logo, entry_for(logo.as_str(), b"png"));

        assert!(cache.match_request(&Request::get(logo.clone())).is_some());
        assert!(cache
            .match_request(&Request::post(logo, Bytes::from_static(b"x")))
            .is_none());
    }

    #[test]
    fn test_entry_to_response() {
        let entry = entry_for("https://example.com/offline/", b"<p>offline</p>");
        let response = entry.to_response().unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert!(response.is_from_cache());
        assert_eq!(response.text().unwrap(), "<p>offline</p>");
        assert_eq!(response.headers.get(CONTENT_TYPE).unwrap(), "text/html");
    }

    #[test]
    fn test_corrupt_entry_status() {
        let mut entry = entry_for("https://example.com/offline/", b"");
        entry.status = 42;
        assert!(matches!(
            entry.to_response(),
            Err(ServiceWorkerError::CacheError(_))
        ));
    }

    #[test]
    fn test_cache_storage_open_delete() {
        let mut storage = CacheStorage::new();
        assert!(!storage.has("v1"));

        storage.open("v0");
        storage.open("v1");
        storage.open("v0");
        assert_eq!(storage.keys(), vec!["v0", "v1"]);

        assert!(storage.delete("v0"));
        assert!(!storage.delete("v0"));
        assert_eq!(storage.keys(), vec!["v1"]);
    }

    #[test]
    fn test_match_across_caches() {
        let mut storage = CacheStorage::new();
        let logo = url("https://example.com/static/logo1.png");
        storage.open("old").put(&logo, entry_for(logo.as_str(), b"old"));
        storage.open("new").put(&logo, entry_for(logo.as_str(), b"new"));

        // Oldest cache wins.
        assert_eq!(storage.match_url(&logo).unwrap().body, b"old".to_vec());
        assert!(storage.match_url(&url("https://example.com/nope")).is_none());
    }

    #[test]
    fn test_snapshot_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");

        let mut storage = CacheStorage::new();
        let bg = url("https://example.com/static/background.jpg");
        storage
            .open("smrps-pwa-v1")
            .put(&bg, entry_for(bg.as_str(), &[0xff, 0xd8, 0x00, 0x10]));
        storage.open("empty");
        storage.save_to(&path).unwrap();

        let restored = CacheStorage::load_from(&path).unwrap();
        assert_eq!(restored.keys(), vec!["smrps-pwa-v1", "empty"]);
        assert_eq!(
            restored.match_url(&bg).unwrap(),
            storage.match_url(&bg).unwrap()
        );
    }

    #[test]
    fn test_snapshot_with_repeated_bucket_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");

        let mut storage = CacheStorage::new();
        storage.open("a");
        storage.save_to(&path).unwrap();

        let mut json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let bucket = json["caches"][0].clone();
        json["caches"].as_array_mut().unwrap().push(bucket);
        std::fs::write(&path, json.to_string()).unwrap();

        assert!(matches!(
            CacheStorage::load_from(&path),
            Err(PwaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_snapshot_io_errors_share_category() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("caches.json");

        let save = CacheStorage::new().save_to(&path).unwrap_err();
        let load = CacheStorage::load_from(&path).unwrap_err();
        assert_eq!(save.category(), "io");
        assert_eq!(load.category(), "io");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::load_or_default(dir.path().join("absent.json")).unwrap();
        assert!(storage.keys().is_empty());
    }

    #[test]
    fn test_snapshot_version_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");
        std::fs::write(&path, r#"{ "version": 99, "caches": [] }"#).unwrap();

        assert!(matches!(
            CacheStorage::load_from(&path),
            Err(PwaError::InvalidArgument(_))
        ));
    }
}
