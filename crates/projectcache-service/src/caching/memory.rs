use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};

use super::entry::{CacheEntry, CacheStats};
use super::freshness::{Clock, FORCED_STALE, Freshness, FreshnessPolicy};
use super::{CacheError, LoadResult};
use crate::types::{ProjectId, ProjectSnapshot};
use crate::utils::defer::defer;

/// Produces fresh snapshots for the [`ProjectCache`].
pub trait SnapshotLoader: Send + Sync + 'static {
    /// Assembles a complete snapshot of the project.
    ///
    /// Returns `Ok(None)` if the project does not exist.
    fn load<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, LoadResult<ProjectSnapshot>>;
}

type ReloadResult = LoadResult<Arc<ProjectSnapshot>>;
type ReloadChannel = Shared<oneshot::Receiver<ReloadResult>>;

/// Why a reload was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Nothing was cached for the project.
    Miss,
    /// The cached entry was too old, or invalidated.
    Expired,
    /// The caller asked for a reload.
    Forced,
    /// The cached entry was stale and served, the reload runs in the background.
    Background,
}

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Trigger::Miss => "miss",
            Trigger::Expired => "expired",
            Trigger::Forced => "forced",
            Trigger::Background => "background",
        }
    }
}

/// Cache state of a single project.
///
/// A slot exists while an entry is cached or the first load of the project is in flight.
#[derive(Debug)]
struct Slot {
    entry: Option<CacheEntry>,
    /// Changes on every invalidation, so a reload can tell whether it raced with one.
    epoch: u64,
}

#[derive(Debug)]
struct RunningReload {
    id: u64,
    channel: ReloadChannel,
}

#[derive(Debug, Default)]
struct State {
    slots: HashMap<ProjectId, Slot>,
    /// Reloads that are currently in flight, at most one per project.
    reloads: HashMap<ProjectId, RunningReload>,
    /// Source of unique slot epochs and reload ids.
    sequence: u64,
}

impl State {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Unregisters the reload `id` of this project, unless a newer one took its place.
    ///
    /// Returns whether the reload was still registered.
    fn finish_reload(&mut self, project_id: &str, id: u64) -> bool {
        let current = self
            .reloads
            .get(project_id)
            .is_some_and(|reload| reload.id == id);
        if current {
            self.reloads.remove(project_id);
        }
        current
    }
}

struct Inner {
    policy: FreshnessPolicy,
    clock: Arc<dyn Clock>,
    loader: Arc<dyn SnapshotLoader>,
    state: Mutex<State>,
}

impl Inner {
    /// Locks the bookkeeping state.
    ///
    /// The lock is never held across an `.await`, and the state is consistent between any two
    /// statements, so a poisoned lock is safe to reuse.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes the result of a finished reload into the cache and unregisters the reload.
    fn commit(
        &self,
        project_id: &ProjectId,
        reload_id: u64,
        epoch: u64,
        trigger: Trigger,
        result: LoadResult<ProjectSnapshot>,
    ) -> ReloadResult {
        let now = self.clock.now().max(FORCED_STALE + 1);
        let mut state = self.state();
        // A reload detached by `evict` or `clear_all` only answers its waiters, the slot
        // belongs to whatever was loaded since.
        let current = state.finish_reload(project_id, reload_id);

        match result {
            Ok(Some(snapshot)) => {
                let snapshot = Arc::new(snapshot);
                match state.slots.get_mut(project_id).filter(|_| current) {
                    Some(slot) => {
                        let last_refreshed_at = if slot.epoch == epoch {
                            now
                        } else {
                            tracing::debug!(
                                %project_id,
                                "Project was invalidated during reload, storing as stale"
                            );
                            FORCED_STALE
                        };
                        let entry = CacheEntry::new(Arc::clone(&snapshot), last_refreshed_at);
                        slot.entry = Some(entry);
                    }
                    None => {
                        tracing::debug!(%project_id, "Project was evicted during reload");
                    }
                }
                Ok(Some(snapshot))
            }
            Ok(None) => {
                if current && state.slots.remove(project_id).is_some() {
                    tracing::debug!(%project_id, "Project no longer exists, evicting");
                }
                Ok(None)
            }
            Err(err) => {
                metric!(
                    counter("project_cache.reload.failed") += 1,
                    "trigger" => trigger.as_str(),
                    "error" => err.metrics_tag(),
                );
                // a first load leaves nothing behind, an existing entry stays servable
                if current
                    && state
                        .slots
                        .get(project_id)
                        .is_some_and(|slot| slot.entry.is_none())
                {
                    state.slots.remove(project_id);
                }
                drop(state);

                if trigger == Trigger::Background {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        %project_id,
                        "Failed to refresh stale project data",
                    );
                } else {
                    tracing::debug!(
                        error = &err as &dyn std::error::Error,
                        %project_id,
                        trigger = trigger.as_str(),
                        "Failed to reload project data",
                    );
                }
                Err(err)
            }
        }
    }
}

/// An in-memory, per-project read-through cache of [`ProjectSnapshot`]s.
///
/// Reads are answered according to the [`FreshnessPolicy`]: fresh entries are returned directly,
/// stale entries are returned while a background refresh runs, and expired or missing entries
/// are reloaded before returning.
///
/// Reloads are deduplicated per project: while one is in flight, every other reader of the same
/// project waits for its result instead of starting another one. Reloads of different projects
/// run independently.
///
/// The cache is cheap to clone, all clones share the same state.
#[derive(Clone)]
pub struct ProjectCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for ProjectCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, reloads) = self
            .inner
            .state
            .try_lock()
            .map(|state| (state.slots.len(), state.reloads.len()))
            .unwrap_or_default();
        f.debug_struct("ProjectCache")
            .field("policy", &self.inner.policy)
            .field("clock", &self.inner.clock)
            .field("entries", &entries)
            .field("running reloads", &reloads)
            .finish()
    }
}

impl ProjectCache {
    pub fn new(
        policy: FreshnessPolicy,
        loader: Arc<dyn SnapshotLoader>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inner = Inner {
            policy,
            clock,
            loader,
            state: Mutex::new(State::default()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Returns the snapshot of a project, or `None` if the project does not exist.
    ///
    /// With `force_refresh`, the project is always reloaded before returning, replacing any
    /// cached entry.
    ///
    /// # Errors
    ///
    /// Fails if a reload the caller has to wait for fails. The cached state is left untouched in
    /// that case. Failures of background refreshes are only logged.
    pub async fn get(&self, project_id: &str, force_refresh: bool) -> ReloadResult {
        metric!(counter("project_cache.access") += 1);

        let now = self.inner.clock.now();
        // Classifying the entry and registering a reload happen under the same lock, so a
        // reload that finishes in between cannot be followed by a redundant one.
        let channel = {
            let mut state = self.inner.state();
            let cached = state
                .slots
                .get(project_id)
                .and_then(|slot| slot.entry.as_ref())
                .map(|entry| {
                    let freshness = self.inner.policy.classify(now, entry.last_refreshed_at);
                    (freshness, Arc::clone(&entry.snapshot))
                });

            match cached {
                _ if force_refresh => self.reload_channel(&mut state, project_id, Trigger::Forced),
                None => {
                    metric!(counter("project_cache.miss") += 1);
                    self.reload_channel(&mut state, project_id, Trigger::Miss)
                }
                Some((freshness @ Freshness::Fresh, snapshot)) => {
                    metric!(counter("project_cache.hit") += 1, "freshness" => freshness.as_str());
                    return Ok(Some(snapshot));
                }
                Some((freshness @ Freshness::Stale, snapshot)) => {
                    metric!(counter("project_cache.hit") += 1, "freshness" => freshness.as_str());
                    // The reload is spawned eagerly, there is nothing to wait for.
                    let _ = self.reload_channel(&mut state, project_id, Trigger::Background);
                    return Ok(Some(snapshot));
                }
                Some((Freshness::Expired, _)) => {
                    metric!(counter("project_cache.miss") += 1);
                    self.reload_channel(&mut state, project_id, Trigger::Expired)
                }
            }
        };

        match channel.await {
            Ok(result) => result,
            Err(oneshot::Canceled) => {
                tracing::error!(%project_id, "Project reload went away without a result");
                Err(CacheError::InternalError)
            }
        }
    }

    /// Marks the cached entry of a project as stale, without removing it.
    ///
    /// The next read of the project reloads it. A reload that is in flight while this is
    /// called stores its result as stale as well. Does nothing if the project is not cached.
    pub fn invalidate(&self, project_id: &str) {
        let mut state = self.inner.state();
        let epoch = state.next_sequence();
        if let Some(slot) = state.slots.get_mut(project_id) {
            slot.epoch = epoch;
            if let Some(entry) = slot.entry.as_mut() {
                entry.last_refreshed_at = FORCED_STALE;
            }
            metric!(counter("project_cache.invalidate") += 1);
            tracing::trace!(%project_id, "Invalidated project");
        }
    }

    /// Removes the cached entry of a project. Returns whether an entry was removed.
    ///
    /// A reload of the project that is in flight still answers its waiters, but its result is
    /// not cached, and the next read starts a new one.
    pub fn evict(&self, project_id: &str) -> bool {
        let mut state = self.inner.state();
        state.reloads.remove(project_id);
        let removed = state.slots.remove(project_id);
        removed.is_some_and(|slot| slot.entry.is_some())
    }

    /// Removes all cached entries, detaching in-flight reloads the same way as [`Self::evict`].
    pub fn clear_all(&self) {
        let mut state = self.inner.state();
        let slots = std::mem::take(&mut state.slots);
        let reloads = std::mem::take(&mut state.reloads);
        drop(state);
        tracing::debug!(
            entries = slots.len(),
            reloads = reloads.len(),
            "Cleared project cache"
        );
    }

    /// Returns the cached entry of a project without loading or refreshing it.
    pub fn peek(&self, project_id: &str) -> Option<CacheEntry> {
        let state = self.inner.state();
        state.slots.get(project_id)?.entry.clone()
    }

    /// Returns the number of cached entries, their ids and their approximate size.
    pub fn stats(&self) -> CacheStats {
        let (mut projects, memory_usage) = {
            let state = self.inner.state();
            let mut projects = Vec::with_capacity(state.slots.len());
            let mut memory_usage = 0;
            for (project_id, slot) in &state.slots {
                if let Some(entry) = &slot.entry {
                    projects.push(project_id.to_string());
                    memory_usage += entry.weight;
                }
            }
            (projects, memory_usage)
        };
        projects.sort_unstable();

        metric!(gauge("project_cache.entries") = projects.len() as u64);
        metric!(gauge("project_cache.memory") = memory_usage);

        CacheStats {
            size: projects.len(),
            projects,
            memory_usage,
        }
    }

    /// Returns the channel of the in-flight reload of this project, starting one if needed.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the reload
    /// even if nobody awaits its result.
    fn reload_channel(
        &self,
        state: &mut State,
        project_id: &str,
        trigger: Trigger,
    ) -> ReloadChannel {
        if let Some(reload) = state.reloads.get(project_id) {
            metric!(
                counter("project_cache.reload.coalesced") += 1,
                "trigger" => trigger.as_str(),
            );
            return reload.channel.clone();
        }

        metric!(counter("project_cache.reload") += 1, "trigger" => trigger.as_str());
        tracing::trace!(%project_id, trigger = trigger.as_str(), "Spawning project reload");

        let project_id: ProjectId = Arc::from(project_id);
        let reload_id = state.next_sequence();
        let epoch = match state.slots.get(&project_id) {
            Some(slot) => slot.epoch,
            None => {
                let epoch = state.next_sequence();
                let slot = Slot { entry: None, epoch };
                state.slots.insert(Arc::clone(&project_id), slot);
                epoch
            }
        };

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        let reload = RunningReload {
            id: reload_id,
            channel: channel.clone(),
        };
        state.reloads.insert(Arc::clone(&project_id), reload);

        let inner = Arc::clone(&self.inner);
        let task = async move {
            // Makes sure the reload is unregistered even if loading panics.
            let unregister = {
                let inner = Arc::clone(&inner);
                let project_id = Arc::clone(&project_id);
                defer(move || {
                    inner.state().finish_reload(&project_id, reload_id);
                })
            };

            let start = Instant::now();
            let result = inner.loader.load(&project_id).await;
            metric!(
                timer("project_cache.reload.duration") = start.elapsed(),
                "trigger" => trigger.as_str(),
            );

            let result = inner.commit(&project_id, reload_id, epoch, trigger, result);
            unregister.cancel();
            sender.send(result).ok();
        };

        // Background reloads outlive the request that triggered them, so they get their own hub.
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));

        channel
    }
}
