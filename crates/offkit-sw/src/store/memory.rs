//! In-memory cache backend.

use hashbrown::HashMap;
use offkit_common::Timestamp;
use parking_lot::RwLock;
use tracing::debug;

use super::{CacheBackend, CacheEntry};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Partition {
    entries: HashMap<String, CacheEntry>,
    bytes: usize,
}

impl Partition {
    fn insert(&mut self, entry: CacheEntry) {
        self.bytes += entry.size();
        if let Some(old) = self.entries.insert(entry.url.clone(), entry) {
            self.bytes -= old.size();
        }
    }

    fn remove(&mut self, url: &str) -> bool {
        match self.entries.remove(url) {
            Some(old) => {
                self.bytes -= old.size();
                true
            }
            None => false,
        }
    }

    fn evict_beyond(&mut self, max_entries: usize) -> Vec<String> {
        if self.entries.len() <= max_entries {
            return Vec::new();
        }
        let mut by_age: Vec<(Timestamp, String)> = self
            .entries
            .values()
            .map(|e| (e.captured_at, e.url.clone()))
            .collect();
        by_age.sort();
        let excess = self.entries.len() - max_entries;
        let evicted: Vec<String> = by_age.into_iter().take(excess).map(|(_, url)| url).collect();
        for url in &evicted {
            self.remove(url);
        }
        evicted
    }
}

/// Cache backend held entirely in memory, with an optional byte quota
/// shared by all partitions.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    partitions: RwLock<HashMap<String, Partition>>,
    quota_bytes: Option<usize>,
}

impl MemoryBackend {
    /// Create an unbounded backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that rejects writes past `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Bytes currently stored across all partitions.
    pub fn used_bytes(&self) -> usize {
        self.partitions.read().values().map(|p| p.bytes).sum()
    }
}

impl CacheBackend for MemoryBackend {
    fn open_partition(&self, name: &str) -> Result<(), StoreError> {
        self.partitions.write().entry(name.to_string()).or_default();
        Ok(())
    }

    fn has_partition(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.partitions.read().contains_key(name))
    }

    fn partition_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.partitions.read().keys().cloned().collect())
    }

    fn delete_partition(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.partitions.write().remove(name).is_some())
    }

    fn get(&self, partition: &str, url: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self
            .partitions
            .read()
            .get(partition)
            .and_then(|p| p.entries.get(url))
            .cloned())
    }

    fn put(
        &self,
        partition: &str,
        entry: CacheEntry,
        max_entries: Option<usize>,
    ) -> Result<Vec<String>, StoreError> {
        let mut partitions = self.partitions.write();

        if let Some(limit) = self.quota_bytes {
            let total: usize = partitions.values().map(|p| p.bytes).sum();
            let replaced = partitions
                .get(partition)
                .and_then(|p| p.entries.get(&entry.url))
                .map_or(0, CacheEntry::size);
            let needed = total - replaced + entry.size();
            if needed > limit {
                return Err(StoreError::QuotaExceeded {
                    partition: partition.to_string(),
                    needed,
                    limit,
                });
            }
        }

        let target = partitions
            .get_mut(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))?;
        target.insert(entry);

        let evicted = max_entries.map_or_else(Vec::new, |max| target.evict_beyond(max));
        if !evicted.is_empty() {
            debug!(partition, evicted = evicted.len(), "Evicted oldest entries");
        }
        Ok(evicted)
    }

    fn put_all(&self, partition: &str, entries: Vec<CacheEntry>) -> Result<(), StoreError> {
        let mut partitions = self.partitions.write();

        if let Some(limit) = self.quota_bytes {
            let total: usize = partitions.values().map(|p| p.bytes).sum();
            // Last entry per URL wins; replaced entries free their bytes.
            let incoming: HashMap<&str, usize> = entries.iter().map(|e| (e.url.as_str(), e.size())).collect();
            let existing = partitions.get(partition);
            let replaced: usize = incoming
                .keys()
                .filter_map(|url| existing.and_then(|p| p.entries.get(*url)))
                .map(CacheEntry::size)
                .sum();
            let needed = total - replaced + incoming.values().sum::<usize>();
            if needed > limit {
                return Err(StoreError::QuotaExceeded {
                    partition: partition.to_string(),
                    needed,
                    limit,
                });
            }
        }

        let target = partitions
            .get_mut(partition)
            .ok_or_else(|| StoreError::UnknownPartition(partition.to_string()))?;
        for entry in entries {
            target.insert(entry);
        }
        Ok(())
    }

    fn delete(&self, partition: &str, url: &str) -> Result<bool, StoreError> {
        Ok(self
            .partitions
            .write()
            .get_mut(partition)
            .is_some_and(|p| p.remove(url)))
    }

    fn keys(&self, partition: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .partitions
            .read()
            .get(partition)
            .map(|p| p.entries.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn clear(&self, partition: &str) -> Result<usize, StoreError> {
        let mut partitions = self.partitions.write();
        Ok(partitions.get_mut(partition).map_or(0, |p| {
            let removed = p.entries.len();
            *p = Partition::default();
            removed
        }))
    }

    fn prune_before(&self, partition: &str, cutoff: Timestamp) -> Result<usize, StoreError> {
        let mut partitions = self.partitions.write();
        let Some(target) = partitions.get_mut(partition) else {
            return Ok(0);
        };
        let expired: Vec<String> = target
            .entries
            .values()
            .filter(|e| e.captured_at < cutoff)
            .map(|e| e.url.clone())
            .collect();
        for url in &expired {
            target.remove(url);
        }
        Ok(expired.len())
    }
}
