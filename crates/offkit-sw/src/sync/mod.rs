//! Durable outbound sync queue.
//!
//! Writes that fail while offline are parked here as [`QueuedOperation`]s
//! and replayed later, in creation order within their lane.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use offkit_common::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

mod queue;

pub use queue::{DrainReport, LaneReport, OutboundSyncQueue, ReplayFailure};

/// A deferred write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: Uuid,
    /// Lane the operation is ordered within (e.g. "cart").
    pub lane: String,
    /// Store-assigned position; strictly increasing in enqueue order.
    pub sequence: u64,
    pub created_at: Timestamp,
    pub endpoint: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Replay attempts that have failed so far.
    pub attempts: u32,
    /// Earliest time the next replay may run.
    pub next_attempt_at: Timestamp,
}

impl QueuedOperation {
    /// Create a pending operation. `sequence` is assigned by the store.
    pub fn new(
        lane: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        body: Bytes,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lane: lane.into(),
            sequence: 0,
            created_at,
            endpoint: endpoint.into(),
            method: method.into(),
            headers: HashMap::new(),
            body,
            attempts: 0,
            next_attempt_at: created_at,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Persistence for queued operations.
pub trait QueueStore: Send + Sync {
    /// Append an operation, assigning its sequence number.
    fn append(&self, op: QueuedOperation) -> Result<QueuedOperation, StoreError>;

    /// Lanes that have pending operations.
    fn lanes(&self) -> Result<Vec<String>, StoreError>;

    /// Oldest pending operation in a lane.
    fn head(&self, lane: &str) -> Result<Option<QueuedOperation>, StoreError>;

    /// Pending operations of a lane in sequence order.
    fn pending(&self, lane: &str) -> Result<Vec<QueuedOperation>, StoreError>;

    /// Remove an operation after a confirmed replay.
    fn remove(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Count a failed attempt and push back the next one. Returns the new
    /// attempt count.
    fn record_failure(&self, id: Uuid, next_attempt_at: Timestamp) -> Result<u32, StoreError>;

    /// Make every pending operation due immediately.
    fn reset_backoff(&self) -> Result<usize, StoreError>;

    /// Pending operation count per lane.
    fn counts(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        let mut counts = BTreeMap::new();
        for lane in self.lanes()? {
            let pending = self.pending(&lane)?.len();
            counts.insert(lane, pending);
        }
        Ok(counts)
    }
}

/// Queue store held in memory. Not durable; for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    inner: Mutex<MemoryQueueInner>,
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
    next_sequence: u64,
    ops: BTreeMap<u64, QueuedOperation>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn append(&self, mut op: QueuedOperation) -> Result<QueuedOperation, StoreError> {
        let mut inner = self.inner.lock();
        inner.next_sequence += 1;
        op.sequence = inner.next_sequence;
        inner.ops.insert(op.sequence, op.clone());
        Ok(op)
    }

    fn lanes(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock();
        let mut lanes: Vec<String> = inner.ops.values().map(|op| op.lane.clone()).collect();
        lanes.sort();
        lanes.dedup();
        Ok(lanes)
    }

    fn head(&self, lane: &str) -> Result<Option<QueuedOperation>, StoreError> {
        Ok(self
            .inner
            .lock()
            .ops
            .values()
            .find(|op| op.lane == lane)
            .cloned())
    }

    fn pending(&self, lane: &str) -> Result<Vec<QueuedOperation>, StoreError> {
        Ok(self
            .inner
            .lock()
            .ops
            .values()
            .filter(|op| op.lane == lane)
            .cloned()
            .collect())
    }

    fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let sequence = inner.ops.values().find(|op| op.id == id).map(|op| op.sequence);
        Ok(sequence.is_some_and(|seq| inner.ops.remove(&seq).is_some()))
    }

    fn record_failure(&self, id: Uuid, next_attempt_at: Timestamp) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock();
        let op = inner
            .ops
            .values_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| StoreError::Corrupt(format!("queued operation {id} vanished")))?;
        op.attempts += 1;
        op.next_attempt_at = next_attempt_at;
        Ok(op.attempts)
    }

    fn reset_backoff(&self) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let mut reset = 0;
        for op in inner.ops.values_mut() {
            if op.next_attempt_at != 0 {
                op.next_attempt_at = 0;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn op(lane: &str, endpoint: &str, body: &str, created_at: Timestamp) -> QueuedOperation {
        QueuedOperation::new(lane, endpoint, "POST", Bytes::copy_from_slice(body.as_bytes()), created_at)
    }

    /// Behaviour every queue store must share.
    pub fn exercise_queue_store(store: &dyn QueueStore) {
        let a = store.append(op("cart", "https://shop.test/api/cart", "a", 5)).unwrap();
        let b = store.append(op("analytics", "https://shop.test/api/analytics", "b", 5)).unwrap();
        let c = store.append(op("cart", "https://shop.test/api/cart", "c", 5)).unwrap();
        assert!(a.sequence < b.sequence && b.sequence < c.sequence);

        assert_eq!(store.lanes().unwrap(), vec!["analytics", "cart"]);
        assert_eq!(store.head("cart").unwrap().unwrap().id, a.id);
        let cart: Vec<Uuid> = store.pending("cart").unwrap().iter().map(|op| op.id).collect();
        assert_eq!(cart, vec![a.id, c.id]);

        assert_eq!(store.record_failure(a.id, 99).unwrap(), 1);
        assert_eq!(store.record_failure(a.id, 120).unwrap(), 2);
        let head = store.head("cart").unwrap().unwrap();
        assert_eq!((head.attempts, head.next_attempt_at), (2, 120));
        assert_eq!(head.body, Bytes::from_static(b"a"));

        assert!(store.reset_backoff().unwrap() >= 1);
        assert_eq!(store.head("cart").unwrap().unwrap().next_attempt_at, 0);

        assert!(store.remove(a.id).unwrap());
        assert!(!store.remove(a.id).unwrap());
        assert_eq!(store.head("cart").unwrap().unwrap().id, c.id);

        let counts = store.counts().unwrap();
        assert_eq!(counts.get("cart"), Some(&1));
        assert_eq!(counts.get("analytics"), Some(&1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_queue_store_contract() {
        testing::exercise_queue_store(&MemoryQueueStore::new());
    }
}
