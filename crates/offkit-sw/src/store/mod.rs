//! Partition storage backends.
//!
//! A backend holds many physical partitions, each a map from request URL to
//! [`CacheEntry`]. Every method is one critical section: a write either
//! lands completely (payload, headers and capture time together) or not at
//! all, and concurrent writes to one key resolve to whichever committed last.

use std::collections::HashMap;

use bytes::Bytes;
use offkit_common::Timestamp;
use offkit_net::NetResponse;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteStore;

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (the key).
    pub url: String,
    /// Request method.
    pub method: String,
    /// Response status.
    pub status: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub payload: Bytes,
    /// Capture time (ms since epoch).
    pub captured_at: Timestamp,
}

impl CacheEntry {
    /// Capture a network response under `url`.
    pub fn from_response(url: impl Into<String>, response: &NetResponse, captured_at: Timestamp) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            status: response.status.as_u16(),
            headers: response.headers.clone(),
            payload: response.body.clone(),
            captured_at,
        }
    }

    /// Approximate stored size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
            + self.url.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// Storage for partitions of cache entries.
pub trait CacheBackend: Send + Sync {
    /// Create a partition if it does not exist.
    fn open_partition(&self, name: &str) -> Result<(), StoreError>;

    /// Check if a partition exists.
    fn has_partition(&self, name: &str) -> Result<bool, StoreError>;

    /// Names of all existing partitions.
    fn partition_names(&self) -> Result<Vec<String>, StoreError>;

    /// Delete a partition and all its entries.
    fn delete_partition(&self, name: &str) -> Result<bool, StoreError>;

    /// Look up one entry.
    fn get(&self, partition: &str, url: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Insert or overwrite an entry, then evict the oldest entries beyond
    /// `max_entries`. Returns the evicted URLs.
    fn put(
        &self,
        partition: &str,
        entry: CacheEntry,
        max_entries: Option<usize>,
    ) -> Result<Vec<String>, StoreError>;

    /// Insert or overwrite a batch atomically.
    fn put_all(&self, partition: &str, entries: Vec<CacheEntry>) -> Result<(), StoreError>;

    /// Delete one entry.
    fn delete(&self, partition: &str, url: &str) -> Result<bool, StoreError>;

    /// URLs of all entries in a partition.
    fn keys(&self, partition: &str) -> Result<Vec<String>, StoreError>;

    /// Delete every entry in a partition, keeping the partition.
    fn clear(&self, partition: &str) -> Result<usize, StoreError>;

    /// Delete entries captured strictly before `cutoff`.
    fn prune_before(&self, partition: &str, cutoff: Timestamp) -> Result<usize, StoreError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn entry(url: &str, body: &str, captured_at: Timestamp) -> CacheEntry {
        CacheEntry {
            url: url.to_string(),
            method: "GET".to_string(),
            status: 200,
            headers: HashMap::from([("content-type".to_string(), "text/plain".to_string())]),
            payload: Bytes::copy_from_slice(body.as_bytes()),
            captured_at,
        }
    }

    /// Behaviour every backend must share.
    pub fn exercise_backend(backend: &dyn CacheBackend) {
        assert!(!backend.has_partition("api-v1").unwrap());
        assert!(matches!(
            backend.put("api-v1", entry("https://shop.test/api/a", "x", 1), None),
            Err(StoreError::UnknownPartition(_))
        ));

        backend.open_partition("api-v1").unwrap();
        backend.open_partition("api-v1").unwrap();
        assert!(backend.has_partition("api-v1").unwrap());

        backend
            .put("api-v1", entry("https://shop.test/api/a", "first", 1), None)
            .unwrap();
        backend
            .put("api-v1", entry("https://shop.test/api/a", "second", 2), None)
            .unwrap();
        let got = backend.get("api-v1", "https://shop.test/api/a").unwrap().unwrap();
        assert_eq!(&got.payload[..], b"second");
        assert_eq!(got.captured_at, 2);
        assert_eq!(got.headers.get("content-type").unwrap(), "text/plain");

        // Bounded writes evict by capture time, oldest first.
        backend.open_partition("images-v1").unwrap();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let url = format!("https://shop.test/{name}.png");
            backend
                .put("images-v1", entry(&url, name, 10 + i as u64), Some(2))
                .unwrap();
        }
        let mut keys = backend.keys("images-v1").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["https://shop.test/b.png", "https://shop.test/c.png"]);

        assert_eq!(backend.prune_before("images-v1", 12).unwrap(), 1);
        assert_eq!(backend.keys("images-v1").unwrap(), vec!["https://shop.test/c.png"]);

        backend
            .put_all(
                "api-v1",
                vec![entry("https://shop.test/api/b", "b", 3), entry("https://shop.test/api/c", "c", 3)],
            )
            .unwrap();
        assert_eq!(backend.keys("api-v1").unwrap().len(), 3);
        assert!(backend.delete("api-v1", "https://shop.test/api/b").unwrap());
        assert!(!backend.delete("api-v1", "https://shop.test/api/b").unwrap());
        assert_eq!(backend.clear("api-v1").unwrap(), 2);
        assert!(backend.has_partition("api-v1").unwrap());

        let mut names = backend.partition_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["api-v1", "images-v1"]);
        assert!(backend.delete_partition("images-v1").unwrap());
        assert!(!backend.delete_partition("images-v1").unwrap());
        assert_eq!(backend.get("images-v1", "https://shop.test/c.png").unwrap(), None);
    }
}
