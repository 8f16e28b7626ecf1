//! Service worker container: registrations, lifecycle driving, fetch routing.

use std::sync::Arc;

use hashbrown::HashMap;
use pwa_net::{Fetcher, Request, Response};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::event::{ExtendableEvent, FetchEvent, LifecycleEventKind};
use crate::{
    ServiceWorker, ServiceWorkerError, ServiceWorkerHandler, ServiceWorkerId,
    ServiceWorkerRegistration, ServiceWorkerState, WorkerScope,
};

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL. Defaults to the script's directory.
    pub scope: Option<String>,
}

/// Service worker events.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { registration_scope: String },
    /// A different worker now handles fetches for the scope.
    ControllerChange { registration_scope: String },
}

/// Public view of a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInfo {
    pub id: ServiceWorkerId,
    pub script_url: String,
    pub state: ServiceWorkerState,
}

impl From<&ServiceWorker> for WorkerInfo {
    fn from(worker: &ServiceWorker) -> Self {
        Self {
            id: worker.id,
            script_url: worker.script_url.to_string(),
            state: worker.state,
        }
    }
}

/// Derive the default scope: the directory containing the script.
fn default_scope(script_url: &Url) -> Url {
    let mut scope = script_url.clone();
    let dir = match script_url.path().rfind('/') {
        Some(idx) => &script_url.path()[..=idx],
        None => "/",
    };
    scope.set_path(dir);
    scope.set_query(None);
    scope.set_fragment(None);
    scope
}

/// Service worker container (`navigator.serviceWorker`).
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    /// Caches and network shared by every worker.
    scope: WorkerScope,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container with empty cache storage.
    pub fn new(fetcher: Arc<dyn Fetcher>) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        Self::with_caches(fetcher, CacheStorage::new())
    }

    /// Create a container over previously persisted cache storage.
    pub fn with_caches(
        fetcher: Arc<dyn Fetcher>,
        caches: CacheStorage,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                scope: WorkerScope::new(Arc::new(RwLock::new(caches)), fetcher),
                event_tx,
            },
            event_rx,
        )
    }

    /// Caches and network handed to workers.
    pub fn scope(&self) -> &WorkerScope {
        &self.scope
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, scope: &str, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        debug!(scope, worker = %worker_id, state = %new_state, "Worker state changed");
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id,
            new_state,
        });
    }

    fn resolve_scope(script_url: &Url, options: &RegistrationOptions) -> Result<Url, ServiceWorkerError> {
        let scope = match options.scope {
            Some(ref s) => script_url
                .join(s)
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
            None => default_scope(script_url),
        };

        if scope.origin() != script_url.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {} is not same-origin with {}",
                scope, script_url
            )));
        }
        let allowed = default_scope(script_url);
        if !scope.path().starts_with(allowed.path()) {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {} is outside the script directory {}",
                scope.path(),
                allowed.path()
            )));
        }
        Ok(scope)
    }

    /// Register a worker and run its install event.
    ///
    /// The worker activates immediately when the scope has no active worker;
    /// otherwise it waits for [`activate`](Self::activate).
    #[instrument(skip(self, options, handler))]
    pub async fn register(
        &self,
        script_url: &str,
        options: RegistrationOptions,
        handler: Arc<dyn ServiceWorkerHandler>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        let scope = Self::resolve_scope(&script_url, &options)?;
        let scope_key = scope.to_string();

        let worker_id = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_key.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope));
            registration.update(script_url, handler.clone()).id
        };

        info!(scope = %scope_key, worker = %worker_id, "Installing service worker");
        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_key.clone(),
        });
        self.emit_state(&scope_key, worker_id, ServiceWorkerState::Installing);

        let outcome = self.dispatch_lifecycle(&handler, LifecycleEventKind::Install).await;

        let has_active = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&scope_key)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_key.clone()))?;

            match outcome {
                Ok(()) => {
                    if let Some(replaced) = registration.install_complete(worker_id) {
                        self.emit_state(&scope_key, replaced.id, ServiceWorkerState::Redundant);
                    }
                    registration.active.is_some()
                }
                Err(e) => {
                    registration.install_failed(worker_id);
                    if registration.is_empty() {
                        registrations.remove(&scope_key);
                    }
                    warn!(scope = %scope_key, worker = %worker_id, error = %e, "Install failed");
                    self.emit_state(&scope_key, worker_id, ServiceWorkerState::Redundant);
                    return Err(ServiceWorkerError::InstallFailed(e.to_string()));
                }
            }
        };
        self.emit_state(&scope_key, worker_id, ServiceWorkerState::Installed);

        if !has_active {
            self.activate(&scope_key).await?;
        }
        Ok(worker_id)
    }

    /// Resume a worker that was activated in an earlier session, without
    /// dispatching install or activate.
    pub async fn restore(
        &self,
        script_url: &str,
        options: RegistrationOptions,
        handler: Arc<dyn ServiceWorkerHandler>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let script_url = Url::parse(script_url)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;
        let scope = Self::resolve_scope(&script_url, &options)?;
        let scope_key = scope.to_string();

        let mut worker = ServiceWorker::new(script_url, handler);
        worker.set_state(ServiceWorkerState::Activated);
        let worker_id = worker.id;

        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .entry(scope_key.clone())
            .or_insert_with(|| ServiceWorkerRegistration::new(scope));
        if let Some(mut old) = registration.active.replace(worker) {
            old.set_state(ServiceWorkerState::Redundant);
        }
        info!(scope = %scope_key, worker = %worker_id, "Restored active service worker");
        Ok(worker_id)
    }

    /// Activate the waiting worker of a registration.
    ///
    /// Errors from the activate event are logged; the worker still activates.
    #[instrument(skip(self))]
    pub async fn activate(&self, scope: &str) -> Result<(), ServiceWorkerError> {
        let (worker_id, handler) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(scope)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;

            if let Some(previous) = registration.begin_activation()? {
                self.emit_state(scope, previous.id, ServiceWorkerState::Redundant);
            }
            let worker = registration
                .get_active()
                .ok_or_else(|| ServiceWorkerError::StateError(format!("no active worker for {}", scope)))?;
            (worker.id, worker.handler())
        };
        self.emit_state(scope, worker_id, ServiceWorkerState::Activating);

        if let Err(e) = self.dispatch_lifecycle(&handler, LifecycleEventKind::Activate).await {
            warn!(scope, worker = %worker_id, error = %e, "Activate event failed");
        }

        let activated = self
            .registrations
            .write()
            .await
            .get_mut(scope)
            .map(|registration| registration.finish_activation(worker_id))
            .unwrap_or(false);

        if activated {
            info!(scope, worker = %worker_id, "Service worker activated");
            self.emit_state(scope, worker_id, ServiceWorkerState::Activated);
            self.emit(ServiceWorkerEvent::ControllerChange {
                registration_scope: scope.to_string(),
            });
        }
        Ok(())
    }

    async fn dispatch_lifecycle(
        &self,
        handler: &Arc<dyn ServiceWorkerHandler>,
        kind: LifecycleEventKind,
    ) -> Result<(), ServiceWorkerError> {
        let mut event = ExtendableEvent::new(kind);
        match event.kind() {
            LifecycleEventKind::Install => handler.on_install(&self.scope, &mut event)?,
            LifecycleEventKind::Activate => handler.on_activate(&self.scope, &mut event)?,
        }
        debug!(event = ?event.kind(), pending = event.pending(), "Settling lifecycle event");
        event.settle().await
    }

    /// Handler of the activated worker controlling `url`, longest scope first.
    async fn controller_for(&self, url: &Url) -> Option<(String, Arc<dyn ServiceWorkerHandler>)> {
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .filter(|r| r.covers(url))
            .filter_map(|r| {
                r.get_active()
                    .filter(|w| w.is_active())
                    .map(|w| (r.scope.to_string(), w.handler()))
            })
            .max_by_key(|(scope, _)| scope.len())
    }

    /// Route a request through the controlling worker.
    ///
    /// Requests outside every scope, or whose worker does not respond, go
    /// straight to the network.
    pub async fn handle_fetch(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let Some((scope, handler)) = self.controller_for(&request.url).await else {
            debug!(url = %request.url, "No controller, fetching from network");
            return Ok(self.scope.fetch(request).await?);
        };

        let mut event = FetchEvent::new(request);
        let listener_result = handler.on_fetch(&self.scope, &mut event);
        let (request, responder) = event.into_parts();

        let responder = match (listener_result, responder) {
            (_, Some(responder)) => responder,
            (Err(e), None) => {
                warn!(scope = %scope, url = %request.url, error = %e, "Fetch listener failed");
                return Ok(self.scope.fetch(request).await?);
            }
            (Ok(()), None) => return Ok(self.scope.fetch(request).await?),
        };

        responder.await.ok_or_else(|| {
            debug!(scope = %scope, url = %request.url, "Worker produced no response");
            ServiceWorkerError::NoResponse(request.url.to_string())
        })
    }

    /// Get the scope of the registration controlling a URL.
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .filter(|r| r.covers(&url))
            .map(|r| r.scope.to_string())
            .max_by_key(|scope| scope.len())
    }

    /// Get all registration scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    /// Installing, waiting and active workers of a registration.
    pub async fn workers(
        &self,
        scope: &str,
    ) -> Option<(Option<WorkerInfo>, Option<WorkerInfo>, Option<WorkerInfo>)> {
        let registrations = self.registrations.read().await;
        let registration = registrations.get(scope)?;
        Some((
            registration.installing.as_ref().map(WorkerInfo::from),
            registration.waiting.as_ref().map(WorkerInfo::from),
            registration.active.as_ref().map(WorkerInfo::from),
        ))
    }

    /// Unregister a service worker. Caches are left in place.
    pub async fn unregister(&self, scope: &str) -> bool {
        let mut registrations = self.registrations.write().await;
        match registrations.remove(scope) {
            Some(mut registration) => {
                registration.unregister();
                info!(scope, "Service worker unregistered");
                true
            }
            None => false,
        }
    }
}
