//! The project data service, as used by request handlers.

use std::sync::Arc;

use crate::aggregator::ProjectAggregator;
use crate::caching::{CacheStats, Clock, FreshnessPolicy, LoadResult, ProjectCache, SystemClock};
use crate::config::Config;
use crate::invalidation::{InvalidationListener, ProjectSubscription};
use crate::source::{DocumentSource, StoreError};
use crate::types::ProjectSnapshot;

/// Read-through access to aggregated project data.
///
/// Wires a [`ProjectCache`] to a [`ProjectAggregator`] reading from the given
/// [`DocumentSource`], and an [`InvalidationListener`] that invalidates cached projects when the
/// source reports changes.
#[derive(Debug)]
pub struct ProjectDataService {
    cache: ProjectCache,
    listener: InvalidationListener,
}

impl ProjectDataService {
    pub fn new(config: &Config, source: Arc<dyn DocumentSource>) -> Self {
        Self::with_clock(config, source, Arc::new(SystemClock))
    }

    /// Creates the service with a custom clock, which is used for both freshness and the
    /// `loaded_at` time of snapshots.
    pub fn with_clock(
        config: &Config,
        source: Arc<dyn DocumentSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let policy = FreshnessPolicy::from_config(&config.cache);
        let aggregator = ProjectAggregator::new(Arc::clone(&source), Arc::clone(&clock));
        let cache = ProjectCache::new(policy, Arc::new(aggregator), clock);
        let listener = InvalidationListener::new(cache.clone(), source);

        Self { cache, listener }
    }

    /// Returns the data of a project, or `None` if it does not exist.
    ///
    /// Cached data is returned according to the freshness policy. With `force_refresh`, the
    /// project is reloaded from the source first.
    pub async fn get_project_data(
        &self,
        project_id: &str,
        force_refresh: bool,
    ) -> LoadResult<Arc<ProjectSnapshot>> {
        self.cache.get(project_id, force_refresh).await
    }

    /// Invalidates the cached data of a project whenever it changes in the source.
    ///
    /// Subscribing to a project that is already subscribed returns the existing handle.
    pub async fn subscribe_to_project_updates(
        &self,
        project_id: &str,
    ) -> Result<ProjectSubscription, StoreError> {
        self.listener.attach(project_id).await
    }

    /// Removes a single project from the cache, or all projects if `project_id` is `None`.
    ///
    /// Subscriptions stay in place.
    pub fn clear_cache(&self, project_id: Option<&str>) {
        match project_id {
            Some(project_id) => {
                let removed = self.cache.evict(project_id);
                tracing::debug!(%project_id, removed, "Cleared cached project");
            }
            None => self.cache.clear_all(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Detaches all project subscriptions, e.g. on shutdown.
    pub async fn unsubscribe_all(&self) {
        self.listener.unsubscribe_all().await
    }

    pub fn cache(&self) -> &ProjectCache {
        &self.cache
    }

    pub fn listener(&self) -> &InvalidationListener {
        &self.listener
    }
}
