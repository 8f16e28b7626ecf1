//! The worker's global scope: cache storage plus network access.

use std::sync::Arc;

use futures::future::{try_join_all, BoxFuture};
use http::Method;
use pwa_net::{Fetcher, NetError, Request, Response};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage};
use crate::ServiceWorkerError;

/// Shared platform services handed to every event listener.
#[derive(Clone)]
pub struct WorkerScope {
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
}

impl WorkerScope {
    pub fn new(caches: Arc<RwLock<CacheStorage>>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { caches, fetcher }
    }

    /// Cache storage shared by all workers of the container.
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.caches)
    }

    /// Network fetch.
    pub fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetError>> {
        self.fetcher.fetch(request)
    }

    /// Fetch every URL and store the responses in `cache_name`.
    ///
    /// All-or-nothing: a transport failure or a non-2xx status for any URL
    /// leaves the bucket untouched. The bucket is created either way.
    pub async fn cache_add_all(
        &self,
        cache_name: &str,
        urls: &[Url],
    ) -> Result<usize, ServiceWorkerError> {
        self.caches.write().await.open(cache_name);

        let fetches = urls.iter().map(|url| {
            let url = url.clone();
            let fetch = self.fetcher.fetch(Request::get(url.clone()));
            async move {
                let response = fetch.await.map_err(|e| {
                    warn!(url = %url, error = %e, "Precache fetch failed");
                    ServiceWorkerError::NetworkError(format!("{}: {}", url, e))
                })?;
                if !response.ok() {
                    warn!(url = %url, status = %response.status, "Precache fetch returned error status");
                    return Err(ServiceWorkerError::CacheError(format!(
                        "{} responded {}",
                        url, response.status
                    )));
                }
                Ok((url, response))
            }
        });
        let fetched = try_join_all(fetches).await?;

        let mut caches = self.caches.write().await;
        let cache = caches.open(cache_name);
        for (url, response) in &fetched {
            cache.put(url, CacheEntry::from_response(url, &Method::GET, response));
        }
        debug!(cache = cache_name, count = fetched.len(), "Stored precached responses");
        Ok(fetched.len())
    }

    /// Cached response for a request, searching every bucket.
    pub async fn match_request(&self, request: &Request) -> Option<Response> {
        let caches = self.caches.read().await;
        Self::restore(caches.match_request(request)?)
    }

    /// Cached response for a URL, searching every bucket.
    pub async fn match_url(&self, url: &Url) -> Option<Response> {
        let caches = self.caches.read().await;
        Self::restore(caches.match_url(url)?)
    }

    fn restore(entry: &CacheEntry) -> Option<Response> {
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(url = %entry.url, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    /// Names of all buckets, oldest first.
    pub async fn cache_names(&self) -> Vec<String> {
        self.caches
            .read()
            .await
            .keys()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Delete a bucket.
    pub async fn delete_cache(&self, name: &str) -> bool {
        self.caches.write().await.delete(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNetwork;

    fn scope(net: Arc<FakeNetwork>) -> WorkerScope {
        WorkerScope::new(Arc::new(RwLock::new(CacheStorage::new())), net)
    }

    fn urls(list: &[&str]) -> Vec<Url> {
        list.iter().map(|u| Url::parse(u).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_add_all_stores_every_url() {
        let net = FakeNetwork::online();
        net.route("https://example.com/a.css", 200, "a");
        net.route("https://example.com/b.js", 200, "b");
        let scope = scope(net);

        let stored = scope
            .cache_add_all("v1", &urls(&["https://example.com/a.css", "https://example.com/b.js"]))
            .await
            .unwrap();
        assert_eq!(stored, 2);

        let hit = scope
            .match_url(&Url::parse("https://example.com/b.js").unwrap())
            .await
            .unwrap();
        assert!(hit.is_from_cache());
        assert_eq!(hit.text().unwrap(), "b");
    }

    #[tokio::test]
    async fn test_add_all_rejects_error_status() {
        let net = FakeNetwork::online();
        net.route("https://example.com/a.css", 200, "a");
        let scope = scope(net);

        let result = scope
            .cache_add_all("v1", &urls(&["https://example.com/a.css", "https://example.com/gone.png"]))
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::CacheError(_))));

        // Bucket exists but holds nothing.
        assert_eq!(scope.cache_names().await, vec!["v1".to_string()]);
        assert!(scope
            .match_url(&Url::parse("https://example.com/a.css").unwrap())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_add_all_offline() {
        let net = FakeNetwork::online();
        net.set_online(false);
        let scope = scope(net);

        let result = scope
            .cache_add_all("v1", &urls(&["https://example.com/a.css"]))
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::NetworkError(_))));
    }

    #[tokio::test]
    async fn test_delete_cache() {
        let scope = scope(FakeNetwork::online());
        scope.caches().write().await.open("old");
        assert!(scope.delete_cache("old").await);
        assert!(scope.cache_names().await.is_empty());
    }
}
