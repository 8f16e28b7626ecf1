//! # PWA Service Worker
//!
//! A service worker host and the offline caching policy that runs in it.
//!
//! ## Features
//!
//! - **Lifecycle**: install, activate, fetch events with `wait_until` / `respond_with`
//! - **Cache API**: named buckets keyed by request URL, snapshot to disk
//! - **Registration**: installing / waiting / active workers per scope
//! - **Offline policy**: network first, cached fallback when the network is gone
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     │
//!     ├── ServiceWorkerRegistration (per scope)
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker) ──► ServiceWorkerHandler (OfflineWorker)
//!     │
//!     └── WorkerScope
//!             ├── CacheStorage
//!             │       └── Cache: URL → CacheEntry
//!             └── Fetcher (network)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use pwa_common::PwaError;
use pwa_net::NetError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub mod cache;
pub mod container;
pub mod event;
pub mod offline;
pub mod scope;

pub use cache::{Cache, CacheEntry, CacheStorage};
pub use container::{RegistrationOptions, ServiceWorkerContainer, ServiceWorkerEvent, WorkerInfo};
pub use event::{ExtendableEvent, FetchEvent, LifecycleEventKind, ServiceWorkerHandler};
pub use offline::OfflineWorker;
pub use scope::WorkerScope;

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("No response for {0}")]
    NoResponse(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Common(#[from] PwaError),
}

impl From<NetError> for ServiceWorkerError {
    fn from(err: NetError) -> Self {
        Self::NetworkError(err.to_string())
    }
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Initial state, before the install event.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and handling fetches.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,

    /// Event listeners.
    handler: Arc<dyn ServiceWorkerHandler>,
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url, handler: Arc<dyn ServiceWorkerHandler>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
            handler,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }

    /// Event listeners for this worker.
    pub fn handler(&self) -> Arc<dyn ServiceWorkerHandler> {
        Arc::clone(&self.handler)
    }
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Whether the scope covers a URL.
    pub fn covers(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Start installing a new worker, replacing any worker already installing.
    pub fn update(&mut self, script_url: Url, handler: Arc<dyn ServiceWorkerHandler>) -> &ServiceWorker {
        if let Some(mut stale) = self.installing.take() {
            stale.set_state(ServiceWorkerState::Redundant);
        }
        let mut worker = ServiceWorker::new(script_url, handler);
        worker.set_state(ServiceWorkerState::Installing);
        self.installing.insert(worker)
    }

    /// Transition installing to waiting.
    ///
    /// Returns the replaced waiting worker, if any. Does nothing unless `id`
    /// is still the installing worker.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> Option<ServiceWorker> {
        if self.installing.as_ref().map(|w| w.id) != Some(id) {
            return None;
        }
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        let mut replaced = self.waiting.replace(worker);
        if let Some(ref mut old) = replaced {
            old.set_state(ServiceWorkerState::Redundant);
        }
        replaced
    }

    /// Discard a worker whose install event failed.
    pub fn install_failed(&mut self, id: ServiceWorkerId) -> Option<ServiceWorker> {
        if self.installing.as_ref().map(|w| w.id) != Some(id) {
            return None;
        }
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker)
    }

    /// Promote the waiting worker to active in the activating state.
    ///
    /// Returns the previous active worker, now redundant.
    pub fn begin_activation(&mut self) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        let mut worker = self.waiting.take().ok_or_else(|| {
            ServiceWorkerError::StateError(format!("no waiting worker for {}", self.scope))
        })?;
        worker.set_state(ServiceWorkerState::Activating);

        let mut previous = self.active.replace(worker);
        if let Some(ref mut old) = previous {
            old.set_state(ServiceWorkerState::Redundant);
        }
        Ok(previous)
    }

    /// Mark the active worker as activated once its activate event settled.
    pub fn finish_activation(&mut self, id: ServiceWorkerId) -> bool {
        match self.active {
            Some(ref mut worker) if worker.id == id => {
                worker.set_state(ServiceWorkerState::Activated);
                true
            }
            _ => false,
        }
    }

    /// Whether the registration holds no workers at all.
    pub fn is_empty(&self) -> bool {
        self.installing.is_none() && self.waiting.is_none() && self.active.is_none()
    }

    /// Unregister (mark every worker redundant).
    pub fn unregister(&mut self) {
        for slot in [&mut self.active, &mut self.waiting, &mut self.installing] {
            if let Some(mut worker) = slot.take() {
                worker.set_state(ServiceWorkerState::Redundant);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::NoopHandler;
    use super::*;

    fn script() -> Url {
        Url::parse("https://example.com/sw.js").unwrap()
    }

    fn registration() -> ServiceWorkerRegistration {
        ServiceWorkerRegistration::new(Url::parse("https://example.com/").unwrap())
    }

    #[test]
    fn test_service_worker_creation() {
        let worker = ServiceWorker::new(script(), Arc::new(NoopHandler));

        assert_eq!(worker.script_url, script());
        assert_eq!(worker.state, ServiceWorkerState::Parsed);
        assert!(!worker.is_active());
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut registration = registration();
        assert!(registration.is_empty());

        let id = registration.update(script(), Arc::new(NoopHandler)).id;
        assert_eq!(
            registration.installing.as_ref().unwrap().state,
            ServiceWorkerState::Installing
        );

        // Installing -> Installed
        assert!(registration.install_complete(id).is_none());
        assert!(registration.installing.is_none());
        assert_eq!(
            registration.waiting.as_ref().unwrap().state,
            ServiceWorkerState::Installed
        );

        // Installed -> Activating -> Activated
        assert!(registration.begin_activation().unwrap().is_none());
        assert_eq!(
            registration.get_active().unwrap().state,
            ServiceWorkerState::Activating
        );
        assert!(registration.finish_activation(id));
        assert!(registration.get_active().unwrap().is_active());
    }

    #[test]
    fn test_activation_replaces_previous_worker() {
        let mut registration = registration();
        let first = registration.update(script(), Arc::new(NoopHandler)).id;
        registration.install_complete(first);
        registration.begin_activation().unwrap();
        registration.finish_activation(first);

        let second = registration.update(script(), Arc::new(NoopHandler)).id;
        registration.install_complete(second);
        let previous = registration.begin_activation().unwrap().unwrap();

        assert_eq!(previous.id, first);
        assert!(previous.is_redundant());
        assert_eq!(registration.get_active().unwrap().id, second);
    }

    #[test]
    fn test_install_failed_keeps_active() {
        let mut registration = registration();
        let first = registration.update(script(), Arc::new(NoopHandler)).id;
        registration.install_complete(first);
        registration.begin_activation().unwrap();
        registration.finish_activation(first);

        let second = registration.update(script(), Arc::new(NoopHandler)).id;
        let failed = registration.install_failed(second).unwrap();

        assert!(failed.is_redundant());
        assert_eq!(registration.get_active().unwrap().id, first);
        assert!(registration.waiting.is_none());
    }

    #[test]
    fn test_stale_install_completion_ignored() {
        let mut registration = registration();
        let stale = registration.update(script(), Arc::new(NoopHandler)).id;
        let fresh = registration.update(script(), Arc::new(NoopHandler)).id;

        registration.install_complete(stale);
        assert!(registration.waiting.is_none());
        assert_eq!(registration.installing.as_ref().unwrap().id, fresh);
    }

    #[test]
    fn test_begin_activation_without_waiting() {
        let mut registration = registration();
        assert!(matches!(
            registration.begin_activation(),
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[test]
    fn test_unregister() {
        let mut registration = registration();
        let id = registration.update(script(), Arc::new(NoopHandler)).id;
        registration.install_complete(id);
        registration.unregister();
        assert!(registration.is_empty());
    }
}
