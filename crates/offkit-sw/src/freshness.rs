//! Freshness classification of stored entries.

use std::time::Duration;

use offkit_common::Timestamp;
use serde::{Deserialize, Serialize};

use crate::partition::PartitionKey;

/// How usable a stored entry is at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Younger than the partition TTL.
    Fresh,
    /// Captured "in the future" relative to now; the clock moved backwards.
    Stale,
    /// At or past the partition TTL.
    Expired,
}

/// TTL policy for one partition. `None` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    ttl: Option<Duration>,
}

impl FreshnessPolicy {
    pub const fn new(ttl: Option<Duration>) -> Self {
        Self { ttl }
    }

    pub const fn never_expires() -> Self {
        Self { ttl: None }
    }

    /// Default TTL for a partition.
    pub const fn for_partition(key: PartitionKey) -> Self {
        match key {
            PartitionKey::Images => Self::new(Some(Duration::from_secs(7 * 24 * 60 * 60))),
            PartitionKey::Api => Self::new(Some(Duration::from_secs(5 * 60))),
            PartitionKey::Runtime => Self::new(Some(Duration::from_secs(24 * 60 * 60))),
            PartitionKey::Precache | PartitionKey::Offline => Self::never_expires(),
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Classify an entry captured at `captured_at`, queried at `now`.
    pub fn classify(&self, captured_at: Timestamp, now: Timestamp) -> Freshness {
        if captured_at > now {
            return Freshness::Stale;
        }
        match self.ttl {
            None => Freshness::Fresh,
            Some(ttl) => {
                let age = now - captured_at;
                if u128::from(age) >= ttl.as_millis() {
                    Freshness::Expired
                } else {
                    Freshness::Fresh
                }
            }
        }
    }

    /// Capture times strictly below the cutoff are expired at `now`.
    pub fn expiry_cutoff(&self, now: Timestamp) -> Option<Timestamp> {
        let ttl = self.ttl?.as_millis().min(u128::from(u64::MAX)) as u64;
        Some(now.checked_sub(ttl).map_or(0, |t| t.saturating_add(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: u64 = 60_000;

    #[test]
    fn test_boundary_is_expired() {
        for key in [PartitionKey::Images, PartitionKey::Api, PartitionKey::Runtime] {
            let policy = FreshnessPolicy::for_partition(key);
            let ttl = policy.ttl().unwrap().as_millis() as u64;
            let t0 = 1_000_000;

            assert_eq!(policy.classify(t0, t0), Freshness::Fresh);
            assert_eq!(policy.classify(t0, t0 + ttl - 1), Freshness::Fresh);
            assert_eq!(policy.classify(t0, t0 + ttl), Freshness::Expired);
            assert_eq!(policy.classify(t0, t0 + ttl + 1), Freshness::Expired);
        }
    }

    #[test]
    fn test_api_ttl_is_five_minutes() {
        let policy = FreshnessPolicy::for_partition(PartitionKey::Api);
        assert_eq!(policy.classify(0, 4 * MINUTE + 59_000), Freshness::Fresh);
        assert_eq!(policy.classify(0, 5 * MINUTE + 1_000), Freshness::Expired);
    }

    #[test]
    fn test_precache_never_expires() {
        let policy = FreshnessPolicy::for_partition(PartitionKey::Precache);
        assert_eq!(policy.classify(0, u64::MAX), Freshness::Fresh);
        assert_eq!(policy.expiry_cutoff(u64::MAX), None);
    }

    #[test]
    fn test_future_capture_is_stale() {
        let policy = FreshnessPolicy::for_partition(PartitionKey::Runtime);
        assert_eq!(policy.classify(10_000, 5_000), Freshness::Stale);
    }

    #[test]
    fn test_expiry_cutoff_agrees_with_classify() {
        let policy = FreshnessPolicy::for_partition(PartitionKey::Api);
        let now = 100 * MINUTE;
        let cutoff = policy.expiry_cutoff(now).unwrap();
        assert_eq!(policy.classify(cutoff, now), Freshness::Fresh);
        assert_eq!(policy.classify(cutoff - 1, now), Freshness::Expired);
    }

    #[test]
    fn test_expiry_cutoff_before_first_ttl_keeps_everything() {
        let policy = FreshnessPolicy::for_partition(PartitionKey::Api);
        assert_eq!(policy.expiry_cutoff(MINUTE), Some(0));
    }
}
