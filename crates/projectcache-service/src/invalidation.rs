//! Invalidating cached projects on change notifications from the backing store.
//!
//! The [`InvalidationListener`] subscribes to every path a project snapshot is built from. A
//! change event does not reload anything, it only marks the cached entry as stale via
//! [`ProjectCache::invalidate`], and the next reader reloads it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future;

use crate::caching::ProjectCache;
use crate::source::{ChangeEvent, ChangeHandler, DocumentSource, StoreError, Subscription, paths};
use crate::types::ProjectId;

type Registry = HashMap<ProjectId, ProjectSubscription>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps track of which projects are being listened to.
///
/// Every project is attached at most once. Attaching a project that is already attached returns
/// the existing [`ProjectSubscription`] instead of opening more subscriptions.
pub struct InvalidationListener {
    cache: ProjectCache,
    source: Arc<dyn DocumentSource>,
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
}

impl fmt::Debug for InvalidationListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationListener")
            .field("cache", &self.cache)
            .field("attached", &lock(&self.registry).len())
            .finish_non_exhaustive()
    }
}

impl InvalidationListener {
    pub fn new(cache: ProjectCache, source: Arc<dyn DocumentSource>) -> Self {
        Self {
            cache,
            source,
            registry: Default::default(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Starts invalidating `project_id` whenever one of its tracked paths changes.
    ///
    /// If the project is already attached, the existing subscription is returned and nothing new
    /// is opened.
    ///
    /// # Errors
    ///
    /// Fails if one of the subscriptions cannot be opened. The subscriptions that were opened
    /// up to that point are closed again, and the project is not attached.
    pub async fn attach(&self, project_id: &str) -> Result<ProjectSubscription, StoreError> {
        let subscription = {
            let mut registry = lock(&self.registry);
            if let Some(existing) = registry.get(project_id) {
                tracing::debug!(%project_id, "Project is already attached");
                return Ok(existing.clone());
            }

            let subscription = ProjectSubscription {
                inner: Arc::new(SubscriptionInner {
                    project_id: Arc::from(project_id),
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    subscriptions: Mutex::new(Some(Vec::new())),
                    registry: Arc::downgrade(&self.registry),
                }),
            };
            registry.insert(Arc::from(project_id), subscription.clone());
            subscription
        };

        if let Err(err) = self.open_subscriptions(&subscription).await {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                %project_id,
                "Failed to subscribe to project changes",
            );
            subscription.detach().await;
            return Err(err);
        }

        metric!(gauge("invalidation.attached") = lock(&self.registry).len() as u64);
        tracing::debug!(%project_id, "Listening for project changes");
        Ok(subscription)
    }

    /// Opens one subscription per tracked path, all of them concurrently.
    async fn open_subscriptions(
        &self,
        subscription: &ProjectSubscription,
    ) -> Result<(), StoreError> {
        let project_id = &subscription.inner.project_id;
        let handler = self.change_handler(subscription);

        let paths = paths::tracked(project_id);
        let futures = paths
            .iter()
            .map(|path| self.source.subscribe(path, Arc::clone(&handler)));
        let results = future::join_all(futures).await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(opened) => subscription.push(opened).await,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn change_handler(&self, subscription: &ProjectSubscription) -> ChangeHandler {
        let cache = self.cache.clone();
        let inner = Arc::downgrade(&subscription.inner);

        Arc::new(move |event: ChangeEvent| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            // Holding the lock while invalidating makes `detach` wait for running callbacks.
            let subscriptions = lock(&inner.subscriptions);
            if subscriptions.is_some() {
                tracing::trace!(
                    project_id = %inner.project_id,
                    path = %event.path,
                    "Project changed",
                );
                cache.invalidate(&inner.project_id);
            }
        })
    }

    /// Returns whether `project_id` is currently attached.
    pub fn is_attached(&self, project_id: &str) -> bool {
        lock(&self.registry).contains_key(project_id)
    }

    /// Detaches every attached project.
    pub async fn unsubscribe_all(&self) {
        let attached: Vec<_> = lock(&self.registry).drain().map(|(_, sub)| sub).collect();
        tracing::debug!(projects = attached.len(), "Detaching all project listeners");

        future::join_all(attached.iter().map(ProjectSubscription::detach)).await;
        metric!(gauge("invalidation.attached") = 0u64);
    }
}

struct SubscriptionInner {
    project_id: ProjectId,
    /// Tells this attachment apart from later ones of the same project.
    id: u64,
    /// The open subscriptions, `None` once detached.
    subscriptions: Mutex<Option<Vec<Box<dyn Subscription>>>>,
    registry: Weak<Mutex<Registry>>,
}

/// The handle of an attached project.
///
/// Clones share the same subscriptions, detaching any of them detaches all.
#[derive(Clone)]
pub struct ProjectSubscription {
    inner: Arc<SubscriptionInner>,
}

impl fmt::Debug for ProjectSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectSubscription")
            .field("project_id", &self.inner.project_id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl ProjectSubscription {
    pub fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    /// Returns `false` once this subscription has been detached.
    pub fn is_active(&self) -> bool {
        lock(&self.inner.subscriptions).is_some()
    }

    /// Keeps an opened subscription, or closes it right away if this was detached meanwhile.
    async fn push(&self, opened: Box<dyn Subscription>) {
        let rejected = match lock(&self.inner.subscriptions).as_mut() {
            Some(subscriptions) => {
                subscriptions.push(opened);
                None
            }
            None => Some(opened),
        };
        if let Some(rejected) = rejected {
            if let Err(err) = rejected.cancel().await {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    project_id = %self.inner.project_id,
                    "Failed to close subscription",
                );
            }
        }
    }

    /// Closes all subscriptions of this project and removes it from the listener.
    ///
    /// No change event is acted upon once this returns. Calling this more than once is a no-op.
    pub async fn detach(&self) {
        let project_id = &self.inner.project_id;
        let Some(subscriptions) = lock(&self.inner.subscriptions).take() else {
            tracing::trace!(%project_id, "Project listener is already detached");
            return;
        };

        if let Some(registry) = self.inner.registry.upgrade() {
            let mut registry = lock(&registry);
            let registered = registry
                .get(project_id)
                .is_some_and(|sub| sub.inner.id == self.inner.id);
            if registered {
                registry.remove(project_id);
            }
            metric!(gauge("invalidation.attached") = registry.len() as u64);
        }

        let results = future::join_all(subscriptions.into_iter().map(|sub| sub.cancel())).await;
        for err in results.into_iter().filter_map(Result::err) {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                %project_id,
                "Failed to close subscription",
            );
        }
        tracing::debug!(%project_id, "Stopped listening for project changes");
    }
}
