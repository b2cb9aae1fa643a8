//! # Project Cache
//!
//! Request paths that need a project's state (project record, members, backlog, sprints and
//! tasks) read it through the [`ProjectCache`] instead of hitting the backing store every time.
//! The cache keeps one [`CacheEntry`] per project, holding an immutable [`ProjectSnapshot`] and
//! the time it was last refreshed.
//!
//! ## Freshness
//!
//! The [`FreshnessPolicy`] classifies every entry by its age into one of three classes:
//!
//! - [`Freshness::Fresh`]: the entry is returned as is.
//! - [`Freshness::Stale`]: the entry is returned as is, and a refresh is started in the
//!   background (stale-while-revalidate). Readers never wait for it.
//! - [`Freshness::Expired`]: the entry is too old to be served. The reader waits for a reload.
//!
//! A project that is not cached at all behaves like an expired one. The thresholds are
//! configured via [`CacheConfig`](crate::config::CacheConfig) and default to 5 and 10 minutes.
//!
//! ## Invalidation
//!
//! [`ProjectCache::invalidate`] does not remove an entry. It sets its refresh time to the
//! [`FORCED_STALE`] sentinel, which the policy always classifies as expired, so the next reader
//! reloads the project. Explicit removal is done via [`ProjectCache::evict`] and
//! [`ProjectCache::clear_all`].
//!
//! Each invalidation also moves the per-project epoch. A reload remembers the epoch it started
//! with, and if that changed by the time it finishes, its result is stored as forced-stale. This
//! way, a change that happens while a reload is running is never lost.
//!
//! ## Reloads
//!
//! Reloads are performed by a [`SnapshotLoader`], usually the
//! [`ProjectAggregator`](crate::aggregator::ProjectAggregator). Each reload runs in its own
//! spawned task and is registered per project until it finishes. Any reader that needs a reload
//! while one is registered attaches to it instead of starting another one, regardless of whether
//! the running one was started in the background or by a waiting reader.
//!
//! The bookkeeping lock is only held for map operations and never while loading, so reloads of
//! different projects never wait on each other.
//!
//! ## Errors
//!
//! A project that does not exist is reported as `Ok(None)`, and is never cached. A [`CacheError`]
//! from a reload someone waits for is returned to every waiting reader, while whatever was cached
//! before stays in place. Errors of background refreshes are logged and otherwise ignored, the
//! next read of the still-stale entry simply tries again.
//!
//! ### Metrics
//!
//! - `project_cache.access`: All reads.
//! - `project_cache.hit`: Reads served from the cache, tagged with `freshness`.
//! - `project_cache.miss`: Reads that had to wait for a reload.
//! - `project_cache.reload`: Reloads started, tagged with `trigger`.
//! - `project_cache.reload.coalesced`: Reloads that were joined instead of started.
//! - `project_cache.reload.failed`: Failed reloads, tagged with `trigger` and `error`.
//! - `project_cache.reload.duration`: Time spent loading a snapshot.
//! - `project_cache.invalidate`: Invalidations of cached projects.
//! - `project_cache.entries` / `project_cache.memory`: Reported on every [`ProjectCache::stats`].
//!
//! [`ProjectSnapshot`]: crate::types::ProjectSnapshot

mod cache_error;
mod entry;
mod freshness;
mod memory;

pub use cache_error::{CacheError, LoadResult};
pub use entry::{CacheEntry, CacheStats};
pub use freshness::{Clock, FORCED_STALE, Freshness, FreshnessPolicy, SystemClock};
pub use memory::{ProjectCache, SnapshotLoader};
