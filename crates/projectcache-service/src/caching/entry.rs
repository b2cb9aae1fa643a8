use std::sync::Arc;

use serde::Serialize;

use super::freshness::FORCED_STALE;
use crate::types::ProjectSnapshot;
use crate::utils::size::estimate_size;

/// A cached project snapshot together with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached snapshot, shared with every reader.
    pub snapshot: Arc<ProjectSnapshot>,
    /// When `snapshot` was last (re)computed, in epoch millis, or [`FORCED_STALE`].
    pub last_refreshed_at: u64,
    /// Approximate size of `snapshot` in bytes, computed once on insertion.
    pub weight: u64,
}

impl CacheEntry {
    pub fn new(snapshot: Arc<ProjectSnapshot>, last_refreshed_at: u64) -> Self {
        let weight = estimate_size(&*snapshot);
        Self {
            snapshot,
            last_refreshed_at,
            weight,
        }
    }

    /// Whether this entry was invalidated since it was last refreshed.
    pub fn is_forced_stale(&self) -> bool {
        self.last_refreshed_at == FORCED_STALE
    }
}

/// Read-only statistics of the project cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// The number of cached projects.
    pub size: usize,
    /// The ids of all cached projects, sorted.
    pub projects: Vec<String>,
    /// Approximate memory held by all cached snapshots, in bytes.
    pub memory_usage: u64,
}
