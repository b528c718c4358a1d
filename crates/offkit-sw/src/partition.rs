//! Versioned partitions and the registry that owns the active set.
//!
//! ```text
//! PartitionRegistry
//!     ├── backend (CacheBackend, shared by every version)
//!     └── active: Arc<PartitionSet>        ── version "3"
//!             ├── precache-v3  (PartitionStore)
//!             ├── runtime-v3
//!             ├── images-v3
//!             ├── api-v3
//!             └── offline-v3
//! ```
//!
//! Request tasks take a [`PartitionLease`] on the set that is active when
//! they start. Activation swaps the active set and then waits for the old
//! set's leases to drain before its partitions are deleted.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use offkit_common::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::freshness::{Freshness, FreshnessPolicy};
use crate::store::{CacheBackend, CacheEntry};

/// Logical partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKey {
    Precache,
    Runtime,
    Images,
    Api,
    Offline,
}

impl PartitionKey {
    pub const ALL: [PartitionKey; 5] = [
        PartitionKey::Precache,
        PartitionKey::Runtime,
        PartitionKey::Images,
        PartitionKey::Api,
        PartitionKey::Offline,
    ];

    pub const fn logical_name(self) -> &'static str {
        match self {
            PartitionKey::Precache => "precache",
            PartitionKey::Runtime => "runtime",
            PartitionKey::Images => "images",
            PartitionKey::Api => "api",
            PartitionKey::Offline => "offline",
        }
    }

    pub fn from_logical_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.logical_name() == name)
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.logical_name())
    }
}

/// Physical partition name: `{logicalName}-v{version}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionName {
    pub key: PartitionKey,
    pub version: String,
}

impl PartitionName {
    pub fn new(key: PartitionKey, version: impl Into<String>) -> Self {
        Self {
            key,
            version: version.into(),
        }
    }

    /// Parse a physical name. Names this engine did not create yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        let (logical, version) = name.split_once("-v")?;
        let key = PartitionKey::from_logical_name(logical)?;
        if version.is_empty() {
            return None;
        }
        Some(Self::new(key, version))
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.key.logical_name(), self.version)
    }
}

/// Freshness and bounding rules for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPolicy {
    pub freshness: FreshnessPolicy,
    pub max_entries: Option<usize>,
}

impl PartitionPolicy {
    pub fn defaults(key: PartitionKey) -> Self {
        let max_entries = match key {
            PartitionKey::Runtime => Some(100),
            PartitionKey::Images => Some(60),
            PartitionKey::Api => Some(50),
            PartitionKey::Precache | PartitionKey::Offline => None,
        };
        Self {
            freshness: FreshnessPolicy::for_partition(key),
            max_entries,
        }
    }
}

/// Policies for all partitions, indexed by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPolicies([PartitionPolicy; 5]);

impl PartitionPolicies {
    pub fn get(&self, key: PartitionKey) -> PartitionPolicy {
        self.0[key.index()]
    }

    pub fn set(&mut self, key: PartitionKey, policy: PartitionPolicy) {
        self.0[key.index()] = policy;
    }
}

impl Default for PartitionPolicies {
    fn default() -> Self {
        Self(PartitionKey::ALL.map(PartitionPolicy::defaults))
    }
}

/// Handle on one physical partition.
#[derive(Clone)]
pub struct PartitionStore {
    name: PartitionName,
    physical: String,
    policy: PartitionPolicy,
    backend: Arc<dyn CacheBackend>,
}

impl fmt::Debug for PartitionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionStore")
            .field("name", &self.physical)
            .field("policy", &self.policy)
            .finish()
    }
}

impl PartitionStore {
    fn new(name: PartitionName, policy: PartitionPolicy, backend: Arc<dyn CacheBackend>) -> Self {
        let physical = name.to_string();
        Self {
            name,
            physical,
            policy,
            backend,
        }
    }

    pub fn key(&self) -> PartitionKey {
        self.name.key
    }

    /// Physical name, e.g. `api-v3`.
    pub fn name(&self) -> &str {
        &self.physical
    }

    pub fn policy(&self) -> PartitionPolicy {
        self.policy
    }

    pub fn lookup(&self, url: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.backend.get(&self.physical, url)
    }

    /// Write an entry, evicting the oldest beyond the partition bound.
    pub fn put(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let evicted = self
            .backend
            .put(&self.physical, entry, self.policy.max_entries)?;
        for url in evicted {
            debug!(partition = %self.physical, url = %url, "Evicted entry");
        }
        Ok(())
    }

    /// Write a batch atomically.
    pub fn put_all(&self, entries: Vec<CacheEntry>) -> Result<(), StoreError> {
        self.backend.put_all(&self.physical, entries)
    }

    pub fn delete(&self, url: &str) -> Result<bool, StoreError> {
        self.backend.delete(&self.physical, url)
    }

    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.backend.keys(&self.physical)
    }

    pub fn clear(&self) -> Result<usize, StoreError> {
        self.backend.clear(&self.physical)
    }

    pub fn freshness(&self, entry: &CacheEntry, now: Timestamp) -> Freshness {
        self.policy.freshness.classify(entry.captured_at, now)
    }

    /// Remove entries that are expired at `now`.
    pub fn prune_expired(&self, now: Timestamp) -> Result<usize, StoreError> {
        match self.policy.freshness.expiry_cutoff(now) {
            Some(cutoff) => self.backend.prune_before(&self.physical, cutoff),
            None => Ok(0),
        }
    }
}

/// All partitions of one version.
pub struct PartitionSet {
    version: String,
    stores: Vec<PartitionStore>,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl fmt::Debug for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionSet")
            .field("version", &self.version)
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl PartitionSet {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn store(&self, key: PartitionKey) -> &PartitionStore {
        &self.stores[key.index()]
    }

    pub fn stores(&self) -> &[PartitionStore] {
        &self.stores
    }

    /// Number of live leases.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no lease on this set is alive.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Counted handle on a [`PartitionSet`], held for the life of a task.
pub struct PartitionLease {
    set: Arc<PartitionSet>,
}

impl PartitionLease {
    fn acquire(set: Arc<PartitionSet>) -> Self {
        set.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { set }
    }
}

impl Clone for PartitionLease {
    fn clone(&self) -> Self {
        Self::acquire(Arc::clone(&self.set))
    }
}

impl Drop for PartitionLease {
    fn drop(&mut self) {
        self.set.release();
    }
}

impl Deref for PartitionLease {
    type Target = PartitionSet;

    fn deref(&self) -> &PartitionSet {
        &self.set
    }
}

impl fmt::Debug for PartitionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PartitionLease").field(&self.set.version).finish()
    }
}

/// Typed registry of partition sets keyed by `{logicalName, version}`.
pub struct PartitionRegistry {
    backend: Arc<dyn CacheBackend>,
    policies: PartitionPolicies,
    active: RwLock<Option<Arc<PartitionSet>>>,
}

impl PartitionRegistry {
    pub fn new(backend: Arc<dyn CacheBackend>, policies: PartitionPolicies) -> Self {
        Self {
            backend,
            policies,
            active: RwLock::new(None),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Build the set for `version` without touching storage.
    pub fn set_for(&self, version: &str) -> Arc<PartitionSet> {
        let stores = PartitionKey::ALL
            .into_iter()
            .map(|key| {
                PartitionStore::new(
                    PartitionName::new(key, version),
                    self.policies.get(key),
                    Arc::clone(&self.backend),
                )
            })
            .collect();
        Arc::new(PartitionSet {
            version: version.to_string(),
            stores,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Create every partition of `version`. Returns the set and the names
    /// that did not exist before.
    pub fn open_set(&self, version: &str) -> Result<(Arc<PartitionSet>, Vec<String>), StoreError> {
        let set = self.set_for(version);
        let mut created = Vec::new();
        for store in set.stores() {
            if !self.backend.has_partition(store.name())? {
                self.backend.open_partition(store.name())?;
                created.push(store.name().to_string());
            }
        }
        debug!(version, created = created.len(), "Opened partition set");
        Ok((set, created))
    }

    /// Check if every partition of `version` exists in storage.
    pub fn has_set(&self, version: &str) -> Result<bool, StoreError> {
        for key in PartitionKey::ALL {
            if !self
                .backend
                .has_partition(&PartitionName::new(key, version).to_string())?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Lease the active set, if any.
    pub async fn lease(&self) -> Option<PartitionLease> {
        let active = self.active.read().await;
        active.as_ref().map(|set| PartitionLease::acquire(Arc::clone(set)))
    }

    pub async fn active_version(&self) -> Option<String> {
        self.active.read().await.as_ref().map(|s| s.version.clone())
    }

    /// Atomically make `set` the active one, returning the previous set.
    pub async fn swap(&self, set: Arc<PartitionSet>) -> Option<Arc<PartitionSet>> {
        let mut active = self.active.write().await;
        info!(version = %set.version, "Swapping active partition set");
        active.replace(set)
    }

    /// Delete every partition of ours whose version differs from `keep`.
    /// Foreign names are left alone.
    pub fn delete_other_versions(&self, keep: &str) -> Result<Vec<String>, StoreError> {
        let mut deleted = Vec::new();
        for name in self.backend.partition_names()? {
            match PartitionName::parse(&name) {
                Some(parsed) if parsed.version != keep => {
                    self.backend.delete_partition(&name)?;
                    deleted.push(name);
                }
                Some(_) => {}
                None => debug!(partition = %name, "Leaving foreign partition"),
            }
        }
        if !deleted.is_empty() {
            info!(?deleted, "Deleted retired partitions");
        }
        Ok(deleted)
    }

    /// Delete named partitions, logging (not failing on) individual errors.
    pub fn delete_partitions(&self, names: &[String]) -> usize {
        names
            .iter()
            .filter(|name| match self.backend.delete_partition(name) {
                Ok(deleted) => deleted,
                Err(e) => {
                    warn!(partition = %name, error = %e, "Failed to delete partition");
                    false
                }
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::entry;
    use crate::store::MemoryBackend;

    fn registry() -> PartitionRegistry {
        PartitionRegistry::new(Arc::new(MemoryBackend::new()), PartitionPolicies::default())
    }

    #[test]
    fn test_partition_name_roundtrip() {
        let name = PartitionName::new(PartitionKey::Api, "2024.10-1");
        assert_eq!(name.to_string(), "api-v2024.10-1");
        assert_eq!(PartitionName::parse("api-v2024.10-1"), Some(name));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(PartitionName::parse("workbox-precache"), None);
        assert_eq!(PartitionName::parse("api-v"), None);
        assert_eq!(PartitionName::parse("videos-v1"), None);
    }

    #[test]
    fn test_open_set_reports_created_partitions() {
        let registry = registry();
        registry.backend().open_partition("api-v1").unwrap();

        let (set, created) = registry.open_set("1").unwrap();
        assert_eq!(set.version(), "1");
        assert_eq!(created.len(), 4);
        assert!(!created.contains(&"api-v1".to_string()));
        assert!(registry.has_set("1").unwrap());
    }

    #[test]
    fn test_store_bounded_by_policy() {
        let registry = registry();
        let (set, _) = registry.open_set("1").unwrap();
        let api = set.store(PartitionKey::Api);
        for i in 0..60u64 {
            api.put(entry(&format!("https://shop.test/api/{i}"), "x", i)).unwrap();
        }
        assert_eq!(api.keys().unwrap().len(), 50);
        assert!(api.lookup("https://shop.test/api/0").unwrap().is_none());
        assert!(api.lookup("https://shop.test/api/59").unwrap().is_some());
    }

    #[test]
    fn test_prune_expired_uses_partition_ttl() {
        let registry = registry();
        let (set, _) = registry.open_set("1").unwrap();
        let api = set.store(PartitionKey::Api);
        api.put(entry("https://shop.test/api/old", "x", 0)).unwrap();
        api.put(entry("https://shop.test/api/new", "x", 4 * 60_000)).unwrap();

        assert_eq!(api.prune_expired(5 * 60_000).unwrap(), 1);
        assert_eq!(api.keys().unwrap(), vec!["https://shop.test/api/new"]);

        let precache = set.store(PartitionKey::Precache);
        precache.put(entry("https://shop.test/", "x", 0)).unwrap();
        assert_eq!(precache.prune_expired(u64::MAX).unwrap(), 0);
    }

    #[test]
    fn test_delete_other_versions_keeps_current_and_foreign() {
        let registry = registry();
        registry.open_set("1").unwrap();
        registry.open_set("2").unwrap();
        registry.backend().open_partition("third-party-cache").unwrap();

        let deleted = registry.delete_other_versions("2").unwrap();
        assert_eq!(deleted.len(), 5);

        let mut names = registry.backend().partition_names().unwrap();
        names.sort();
        assert_eq!(
            names,
            vec!["api-v2", "images-v2", "offline-v2", "precache-v2", "runtime-v2", "third-party-cache"]
        );
    }

    #[tokio::test]
    async fn test_lease_counts_and_wait_idle() {
        let registry = registry();
        assert!(registry.lease().await.is_none());

        let (set, _) = registry.open_set("1").unwrap();
        registry.swap(Arc::clone(&set)).await;

        let lease = registry.lease().await.unwrap();
        let second = lease.clone();
        assert_eq!(set.in_flight(), 2);
        drop(lease);
        assert_eq!(set.in_flight(), 1);

        let waiter = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(second);
        waiter.await.unwrap();
        assert_eq!(set.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_swap_returns_previous_set() {
        let registry = registry();
        let (one, _) = registry.open_set("1").unwrap();
        let (two, _) = registry.open_set("2").unwrap();

        assert!(registry.swap(one).await.is_none());
        let previous = registry.swap(two).await.unwrap();
        assert_eq!(previous.version(), "1");
        assert_eq!(registry.active_version().await.as_deref(), Some("2"));
    }
}
