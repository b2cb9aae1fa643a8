use std::fmt;
use std::time::Duration;

use crate::config::CacheConfig;

/// The `last_refreshed_at` value of an entry that was explicitly invalidated.
///
/// Such an entry is treated as [`Freshness::Expired`] regardless of its wall-clock age.
pub const FORCED_STALE: u64 = 0;

/// Source of the current time, in milliseconds since the unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> u64;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        // A clock before the epoch would collide with `FORCED_STALE`, so clamp to 1.
        chrono::Utc::now().timestamp_millis().max(1) as u64
    }
}

/// How a cached entry of a certain age is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Served directly.
    Fresh,
    /// Served directly, while a refresh runs in the background.
    Stale,
    /// Not served, the caller waits for a reload.
    Expired,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
            Freshness::Expired => "expired",
        }
    }
}

/// Maps the age of an entry to its [`Freshness`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    fresh_for: u64,
    stale_after: u64,
}

impl FreshnessPolicy {
    /// Creates a policy from the two thresholds.
    ///
    /// `stale_after` has to be longer than `fresh_for`, otherwise entries skip straight from
    /// fresh to expired.
    pub fn new(fresh_for: Duration, stale_after: Duration) -> Self {
        debug_assert!(stale_after > fresh_for);
        Self {
            fresh_for: fresh_for.as_millis() as u64,
            stale_after: stale_after.as_millis() as u64,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.fresh_for, config.stale_after)
    }

    /// Classifies an entry refreshed at `last_refreshed_at`, both in epoch millis.
    ///
    /// The age is `now - last_refreshed_at`, where [`FORCED_STALE`] counts as infinitely old.
    /// A timestamp from the future (clock skew) counts as age zero.
    pub fn classify(&self, now: u64, last_refreshed_at: u64) -> Freshness {
        if last_refreshed_at == FORCED_STALE {
            return Freshness::Expired;
        }
        let age = now.saturating_sub(last_refreshed_at);
        if age < self.fresh_for {
            Freshness::Fresh
        } else if age < self.stale_after {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60 * 1000;

    fn policy() -> FreshnessPolicy {
        FreshnessPolicy::new(Duration::from_secs(5 * 60), Duration::from_secs(10 * 60))
    }

    #[test]
    fn test_classify_by_age() {
        let policy = policy();
        let loaded = 1_000_000;

        assert_eq!(policy.classify(loaded, loaded), Freshness::Fresh);
        assert_eq!(policy.classify(loaded + 3 * MINUTE, loaded), Freshness::Fresh);
        assert_eq!(policy.classify(loaded + 7 * MINUTE, loaded), Freshness::Stale);
        assert_eq!(
            policy.classify(loaded + 12 * MINUTE, loaded),
            Freshness::Expired
        );
    }

    #[test]
    fn test_classify_boundaries() {
        let policy = policy();
        let loaded = 1_000_000;

        assert_eq!(
            policy.classify(loaded + 5 * MINUTE - 1, loaded),
            Freshness::Fresh
        );
        assert_eq!(policy.classify(loaded + 5 * MINUTE, loaded), Freshness::Stale);
        assert_eq!(
            policy.classify(loaded + 10 * MINUTE - 1, loaded),
            Freshness::Stale
        );
        assert_eq!(
            policy.classify(loaded + 10 * MINUTE, loaded),
            Freshness::Expired
        );
    }

    #[test]
    fn test_forced_stale_is_expired() {
        let policy = policy();

        // even at "age zero", the sentinel wins
        assert_eq!(policy.classify(FORCED_STALE, FORCED_STALE), Freshness::Expired);
        assert_eq!(policy.classify(MINUTE, FORCED_STALE), Freshness::Expired);
    }

    #[test]
    fn test_future_timestamp_is_fresh() {
        let policy = policy();
        assert_eq!(policy.classify(1_000, 5_000), Freshness::Fresh);
    }

    #[test]
    fn test_classify_is_exhaustive_over_ages() {
        let policy = policy();
        let loaded = 42;
        for minutes in 0..20 {
            let expected = match minutes {
                0..5 => Freshness::Fresh,
                5..10 => Freshness::Stale,
                _ => Freshness::Expired,
            };
            assert_eq!(
                policy.classify(loaded + minutes * MINUTE, loaded),
                expected,
                "age {minutes}m"
            );
        }
    }

    #[test]
    fn test_system_clock_is_never_sentinel() {
        assert!(SystemClock.now() > FORCED_STALE);
    }
}
