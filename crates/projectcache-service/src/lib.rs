//! An in-process, per-project read-through cache for aggregated project data.
//!
//! The entry point is [`ProjectDataService`](service::ProjectDataService), which combines the
//! [`ProjectCache`](caching::ProjectCache), the [`ProjectAggregator`](aggregator::ProjectAggregator)
//! that fills it, and the [`InvalidationListener`](invalidation::InvalidationListener) that marks
//! entries stale when the backing store reports changes.

#[macro_use]
pub mod metrics;

pub mod aggregator;
pub mod caching;
pub mod config;
pub mod invalidation;
pub mod logging;
pub mod service;
pub mod source;
pub mod types;
pub mod utils;
