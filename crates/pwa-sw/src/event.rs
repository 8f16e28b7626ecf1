//! Lifecycle and fetch events dispatched to a worker.

use std::future::Future;

use futures::future::{try_join_all, BoxFuture, FutureExt};
use pwa_net::{Request, Response};

use crate::{ServiceWorkerError, WorkerScope};

/// Future registered through [`ExtendableEvent::wait_until`].
pub type ExtendFuture = BoxFuture<'static, Result<(), ServiceWorkerError>>;

/// Future registered through [`FetchEvent::respond_with`].
pub type RespondFuture = BoxFuture<'static, Option<Response>>;

/// Which lifecycle event is being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEventKind {
    Install,
    Activate,
}

/// Install or activate event.
///
/// The host keeps the worker in its transitional state until every future
/// passed to [`wait_until`](Self::wait_until) has settled.
pub struct ExtendableEvent {
    kind: LifecycleEventKind,
    pending: Vec<ExtendFuture>,
}

impl ExtendableEvent {
    pub fn new(kind: LifecycleEventKind) -> Self {
        Self {
            kind,
            pending: Vec::new(),
        }
    }

    pub fn kind(&self) -> LifecycleEventKind {
        self.kind
    }

    /// Extend the event's lifetime until `work` completes.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'static,
    {
        self.pending.push(work.boxed());
    }

    /// Number of futures the event is waiting on.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Await all extensions. The first failure fails the event.
    pub async fn settle(self) -> Result<(), ServiceWorkerError> {
        try_join_all(self.pending).await.map(|_| ())
    }
}

/// A request intercepted by the active worker.
pub struct FetchEvent {
    request: Request,
    response: Option<RespondFuture>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: None,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn is_navigation(&self) -> bool {
        self.request.is_navigation()
    }

    /// Provide the response for this request. Resolving to `None` turns the
    /// fetch into a network error. May only be called once.
    pub fn respond_with<F>(&mut self, response: F) -> Result<(), ServiceWorkerError>
    where
        F: Future<Output = Option<Response>> + Send + 'static,
    {
        if self.response.is_some() {
            return Err(ServiceWorkerError::StateError(format!(
                "respond_with already called for {}",
                self.request.url
            )));
        }
        self.response = Some(response.boxed());
        Ok(())
    }

    pub fn has_responded(&self) -> bool {
        self.response.is_some()
    }

    pub(crate) fn into_parts(self) -> (Request, Option<RespondFuture>) {
        (self.request, self.response)
    }
}

/// Event listeners of a worker script.
///
/// Every listener is optional. An error from `on_install` fails the install;
/// an error from `on_fetch` before responding sends the request to the
/// network.
pub trait ServiceWorkerHandler: Send + Sync {
    fn on_install(
        &self,
        _scope: &WorkerScope,
        _event: &mut ExtendableEvent,
    ) -> Result<(), ServiceWorkerError> {
        Ok(())
    }

    fn on_activate(
        &self,
        _scope: &WorkerScope,
        _event: &mut ExtendableEvent,
    ) -> Result<(), ServiceWorkerError> {
        Ok(())
    }

    fn on_fetch(
        &self,
        _scope: &WorkerScope,
        _event: &mut FetchEvent,
    ) -> Result<(), ServiceWorkerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[tokio::test]
    async fn test_wait_until_settles_all() {
        let mut event = ExtendableEvent::new(LifecycleEventKind::Install);
        event.wait_until(async { Ok(()) });
        event.wait_until(async { Ok(()) });

        assert_eq!(event.kind(), LifecycleEventKind::Install);
        assert_eq!(event.pending(), 2);
        assert!(event.settle().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_until_failure_fails_event() {
        let mut event = ExtendableEvent::new(LifecycleEventKind::Activate);
        event.wait_until(async { Ok(()) });
        event.wait_until(async { Err(ServiceWorkerError::CacheError("boom".to_string())) });

        assert!(matches!(
            event.settle().await,
            Err(ServiceWorkerError::CacheError(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_event_settles() {
        let event = ExtendableEvent::new(LifecycleEventKind::Install);
        assert!(event.settle().await.is_ok());
    }

    #[test]
    fn test_respond_with_once() {
        let url = Url::parse("https://example.com/").unwrap();
        let mut event = FetchEvent::new(Request::navigate(url));
        assert!(event.is_navigation());
        assert!(!event.has_responded());

        event.respond_with(async { None }).unwrap();
        assert!(event.has_responded());
        assert!(matches!(
            event.respond_with(async { None }),
            Err(ServiceWorkerError::StateError(_))
        ));
    }
}
