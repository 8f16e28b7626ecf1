//! Network-first policy with an offline fallback.
//!
//! - install: precache the offline page and static assets into one bucket
//! - activate: drop every bucket left over from earlier deployments
//! - fetch: try the network; when it fails, navigations get the offline
//!   page and everything else gets its cached copy, if any

use pwa_common::OfflineConfig;
use tracing::{debug, info};
use url::Url;

use crate::event::{ExtendableEvent, FetchEvent};
use crate::{ServiceWorkerError, ServiceWorkerHandler, WorkerScope};

/// The offline caching worker.
#[derive(Debug, Clone)]
pub struct OfflineWorker {
    cache_name: String,
    offline_page: Url,
    precache: Vec<Url>,
}

impl OfflineWorker {
    /// Build the worker from configuration, resolving every URL up front.
    pub fn new(config: &OfflineConfig) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        Ok(Self {
            cache_name: config.cache_name.clone(),
            offline_page: config.offline_page()?,
            precache: config.precache_urls()?,
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn offline_page(&self) -> &Url {
        &self.offline_page
    }

    pub fn precache(&self) -> &[Url] {
        &self.precache
    }
}

impl ServiceWorkerHandler for OfflineWorker {
    fn on_install(
        &self,
        scope: &WorkerScope,
        event: &mut ExtendableEvent,
    ) -> Result<(), ServiceWorkerError> {
        let scope = scope.clone();
        let cache_name = self.cache_name.clone();
        let urls = self.precache.clone();

        event.wait_until(async move {
            let stored = scope.cache_add_all(&cache_name, &urls).await?;
            info!(cache = %cache_name, stored, "Precached offline assets");
            Ok(())
        });
        Ok(())
    }

    fn on_activate(
        &self,
        scope: &WorkerScope,
        event: &mut ExtendableEvent,
    ) -> Result<(), ServiceWorkerError> {
        let scope = scope.clone();
        let current = self.cache_name.clone();

        event.wait_until(async move {
            for name in scope.cache_names().await {
                if name != current && scope.delete_cache(&name).await {
                    info!(cache = %name, "Deleted stale cache");
                }
            }
            Ok(())
        });
        Ok(())
    }

    fn on_fetch(
        &self,
        scope: &WorkerScope,
        event: &mut FetchEvent,
    ) -> Result<(), ServiceWorkerError> {
        let scope = scope.clone();
        let request = event.request().clone();

        if request.is_navigation() {
            let offline_page = self.offline_page.clone();
            event.respond_with(async move {
                match scope.fetch(request.clone()).await {
                    Ok(response) => Some(response),
                    Err(e) => {
                        debug!(url = %request.url, error = %e, "Navigation failed, serving offline page");
                        scope.match_url(&offline_page).await
                    }
                }
            })
        } else {
            event.respond_with(async move {
                match scope.fetch(request.clone()).await {
                    Ok(response) => Some(response),
                    Err(e) => {
                        debug!(url = %request.url, error = %e, "Fetch failed, trying cache");
                        scope.match_request(&request).await
                    }
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeNetwork;
    use crate::{RegistrationOptions, ServiceWorkerContainer};
    use pwa_net::{Request, RequestMode};
    use std::sync::Arc;

    const ORIGIN: &str = "https://school.example";

    fn worker() -> Arc<OfflineWorker> {
        let config = OfflineConfig::for_origin(Url::parse(ORIGIN).unwrap());
        Arc::new(OfflineWorker::new(&config).unwrap())
    }

    fn url(path: &str) -> String {
        format!("{}{}", ORIGIN, path)
    }

    fn network_with_assets() -> Arc<FakeNetwork> {
        let net = FakeNetwork::online();
        net.route(&url("/offline/"), 200, "<h1>Offline</h1>");
        net.route(&url("/static/logo1.png"), 200, "logo");
        net.route(&url("/static/background.jpg"), 200, "background");
        net
    }

    async fn installed(net: Arc<FakeNetwork>) -> ServiceWorkerContainer {
        let (container, _rx) = ServiceWorkerContainer::new(net);
        container
            .register(&url("/sw.js"), RegistrationOptions::default(), worker())
            .await
            .unwrap();
        container
    }

    #[test]
    fn test_worker_from_default_config() {
        let worker = worker();
        assert_eq!(worker.cache_name(), "smrps-pwa-v1");
        assert_eq!(worker.offline_page().as_str(), url("/offline/"));
        assert_eq!(worker.precache().len(), 3);
    }

    #[tokio::test]
    async fn test_install_precaches_all_assets() {
        let container = installed(network_with_assets()).await;

        let caches = container.scope().caches();
        let caches = caches.read().await;
        let bucket = caches.get("smrps-pwa-v1").unwrap();
        assert_eq!(bucket.len(), 3);
        for path in ["/offline/", "/static/logo1.png", "/static/background.jpg"] {
            assert!(bucket.match_url(&Url::parse(&url(path)).unwrap()).is_some());
        }
    }

    #[tokio::test]
    async fn test_activate_removes_stale_buckets() {
        let net = network_with_assets();
        let (container, _rx) = ServiceWorkerContainer::new(net);
        {
            let caches = container.scope().caches();
            let mut caches = caches.write().await;
            caches.open("smrps-pwa-v0");
            caches.open("unrelated");
        }

        container
            .register(&url("/sw.js"), RegistrationOptions::default(), worker())
            .await
            .unwrap();

        assert_eq!(container.scope().cache_names().await, vec!["smrps-pwa-v1".to_string()]);
    }

    #[tokio::test]
    async fn test_online_responses_pass_through() {
        let net = network_with_assets();
        net.route(&url("/dashboard/"), 500, "server error");
        let container = installed(net).await;

        let response = container
            .handle_fetch(Request::parse(&url("/dashboard/")).unwrap().mode(RequestMode::Navigate))
            .await
            .unwrap();
        assert_eq!(response.status.as_u16(), 500);
        assert!(!response.is_from_cache());
    }

    #[tokio::test]
    async fn test_offline_navigation_serves_offline_page() {
        let net = network_with_assets();
        let container = installed(net.clone()).await;
        net.set_online(false);

        let response = container
            .handle_fetch(Request::parse(&url("/results/term-2/")).unwrap().mode(RequestMode::Navigate))
            .await
            .unwrap();
        assert!(response.is_from_cache());
        assert_eq!(response.text().unwrap(), "<h1>Offline</h1>");
    }

    #[tokio::test]
    async fn test_offline_asset_served_from_cache() {
        let net = network_with_assets();
        let container = installed(net.clone()).await;
        net.set_online(false);

        let response = container
            .handle_fetch(Request::parse(&url("/static/logo1.png")).unwrap().mode(RequestMode::NoCors))
            .await
            .unwrap();
        assert!(response.is_from_cache());
        assert_eq!(response.text().unwrap(), "logo");
    }

    #[tokio::test]
    async fn test_offline_uncached_asset_fails() {
        let net = network_with_assets();
        let container = installed(net.clone()).await;
        net.set_online(false);

        let result = container
            .handle_fetch(Request::parse(&url("/static/app.css")).unwrap())
            .await;
        assert!(matches!(result, Err(ServiceWorkerError::NoResponse(_))));
    }

    #[tokio::test]
    async fn test_successful_fetch_is_not_written_back() {
        let net = network_with_assets();
        net.route(&url("/static/app.css"), 200, "body {}");
        let container = installed(net.clone()).await;

        container
            .handle_fetch(Request::parse(&url("/static/app.css")).unwrap())
            .await
            .unwrap();

        net.set_online(false);
        assert!(container
            .handle_fetch(Request::parse(&url("/static/app.css")).unwrap())
            .await
            .is_err());
    }
}
