//! Lane-ordered replay of queued writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use http::Method;
use offkit_common::{with_timeout, Clock, RetryConfig};
use offkit_net::{NetRequest, Transport};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::{QueueStore, QueuedOperation};
use crate::error::{EngineError, StoreError};

/// Outcome of draining one lane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaneReport {
    pub lane: String,
    /// Operations replayed and removed.
    pub replayed: usize,
    /// Operation whose replay failed and stopped the lane.
    pub failed: Option<ReplayFailure>,
    /// The head was not yet due.
    pub deferred: bool,
    /// Operations still pending after the drain.
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFailure {
    pub id: Uuid,
    pub attempts: u32,
    pub reason: String,
}

/// Outcome of a full drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub lanes: Vec<LaneReport>,
}

impl DrainReport {
    pub fn replayed(&self) -> usize {
        self.lanes.iter().map(|l| l.replayed).sum()
    }

    pub fn remaining(&self) -> usize {
        self.lanes.iter().map(|l| l.remaining).sum()
    }

    pub fn lane(&self, name: &str) -> Option<&LaneReport> {
        self.lanes.iter().find(|l| l.lane == name)
    }
}

/// Durable queue of deferred writes, drained lane by lane.
pub struct OutboundSyncQueue {
    store: Arc<dyn QueueStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    timeout: Duration,
    lane_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl OutboundSyncQueue {
    pub fn new(
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            retry,
            timeout,
            lane_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Persist an operation. Never touches the network.
    pub fn enqueue(&self, op: QueuedOperation) -> Result<QueuedOperation, StoreError> {
        let op = self.store.append(op)?;
        info!(id = %op.id, lane = %op.lane, sequence = op.sequence, endpoint = %op.endpoint, "Queued operation");
        Ok(op)
    }

    /// Replay every lane that is due. Lanes drain concurrently.
    pub async fn drain(&self) -> Result<DrainReport, StoreError> {
        let lanes = self.store.lanes()?;
        if lanes.is_empty() {
            return Ok(DrainReport::default());
        }
        info!(lanes = lanes.len(), "Draining sync queue");

        let results = join_all(lanes.iter().map(|lane| self.drain_lane(lane))).await;
        let lanes = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        let report = DrainReport { lanes };
        info!(replayed = report.replayed(), remaining = report.remaining(), "Drain finished");
        Ok(report)
    }

    /// Replay one lane in sequence order until it empties, fails, or its
    /// head is not yet due.
    pub async fn drain_lane(&self, lane: &str) -> Result<LaneReport, StoreError> {
        let lock = self.lane_lock(lane);
        let _guard = lock.lock().await;

        let mut report = LaneReport {
            lane: lane.to_string(),
            ..Default::default()
        };
        while let Some(op) = self.store.head(lane)? {
            let now = self.clock.now();
            if op.next_attempt_at > now {
                debug!(lane, id = %op.id, due_in_ms = op.next_attempt_at - now, "Lane head not due");
                report.deferred = true;
                break;
            }

            debug!(lane, id = %op.id, sequence = op.sequence, "Replaying operation");
            match self.replay(&op).await {
                Ok(()) => {
                    self.store.remove(op.id)?;
                    report.replayed += 1;
                }
                Err(e) => {
                    let delay = self.retry.delay_after_failures(op.attempts.saturating_add(1));
                    let next = self.clock.now().saturating_add(delay.as_millis() as u64);
                    let attempts = self.store.record_failure(op.id, next)?;
                    warn!(lane, id = %op.id, attempts, retry_in = ?delay, error = %e, "Replay failed");
                    report.failed = Some(ReplayFailure {
                        id: op.id,
                        attempts,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
        }
        report.remaining = self.store.pending(lane)?.len();
        Ok(report)
    }

    /// Clear backoff on every pending operation, then drain.
    pub async fn connectivity_restored(&self) -> Result<DrainReport, StoreError> {
        let reset = self.store.reset_backoff()?;
        debug!(reset, "Cleared replay backoff");
        self.drain().await
    }

    /// Pending operation count per lane.
    pub fn pending_counts(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        self.store.counts()
    }

    pub fn pending(&self, lane: &str) -> Result<Vec<QueuedOperation>, StoreError> {
        self.store.pending(lane)
    }

    async fn replay(&self, op: &QueuedOperation) -> Result<(), EngineError> {
        let failure = |reason: String| EngineError::QueueReplayFailure { id: op.id, reason };

        let url = Url::parse(&op.endpoint).map_err(|e| failure(format!("invalid endpoint: {e}")))?;
        let method = Method::from_bytes(op.method.as_bytes())
            .map_err(|_| failure(format!("invalid method {}", op.method)))?;
        let request = NetRequest::new(method, url)
            .headers(op.headers.clone())
            .body(op.body.clone())
            .timeout(self.timeout);

        let response = with_timeout(self.timeout, self.transport.fetch(request))
            .await
            .map_err(|e| failure(e.to_string()))?
            .map_err(|e| failure(e.to_string()))?;
        if response.ok() {
            Ok(())
        } else {
            Err(failure(format!("server answered {}", response.status)))
        }
    }

    fn lane_lock(&self, lane: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.lane_locks.lock();
        Arc::clone(locks.entry(lane.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::testing::op;
    use crate::sync::MemoryQueueStore;
    use http::StatusCode;
    use offkit_common::ManualClock;
    use offkit_net::fake::{FakeReply, FakeTransport};

    const CART: &str = "https://shop.test/api/cart";
    const ANALYTICS: &str = "https://shop.test/api/analytics";

    fn queue() -> (OutboundSyncQueue, Arc<FakeTransport>, Arc<ManualClock>) {
        let transport = Arc::new(FakeTransport::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let queue = OutboundSyncQueue::new(
            Arc::new(MemoryQueueStore::new()),
            transport.clone(),
            clock.clone(),
            RetryConfig::background(),
            Duration::from_secs(1),
        );
        (queue, transport, clock)
    }

    fn bodies(transport: &FakeTransport, url: &str) -> Vec<String> {
        transport
            .calls()
            .into_iter()
            .filter(|c| c.url == url)
            .map(|c| String::from_utf8_lossy(&c.body.unwrap_or_default()).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_lane_replays_in_creation_order() {
        let (queue, transport, _) = queue();
        transport.respond(CART, "");
        for body in ["o1", "o2", "o3"] {
            queue.enqueue(op("cart", CART, body, 1_000)).unwrap();
        }

        let report = queue.drain().await.unwrap();
        assert_eq!(report.replayed(), 3);
        assert_eq!(bodies(&transport, CART), ["o1", "o2", "o3"]);
        assert!(queue.pending_counts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_stops_lane_and_backs_off() {
        let (queue, transport, clock) = queue();
        transport.respond(CART, "");
        transport.then(CART, FakeReply::ok(""));
        transport.then(CART, FakeReply::status(StatusCode::INTERNAL_SERVER_ERROR, ""));
        for body in ["o1", "o2", "o3"] {
            queue.enqueue(op("cart", CART, body, 1_000)).unwrap();
        }

        let report = queue.drain().await.unwrap();
        let lane = report.lane("cart").unwrap();
        assert_eq!(lane.replayed, 1);
        assert_eq!(lane.remaining, 2);
        let failed = lane.failed.as_ref().unwrap();
        assert_eq!(failed.attempts, 1);
        assert_eq!(bodies(&transport, CART), ["o1", "o2"]);

        let head = &queue.pending("cart").unwrap()[0];
        assert_eq!(head.attempts, 1);
        assert_eq!(head.next_attempt_at, 1_000 + 30_000);

        // Not yet due: nothing is sent.
        let deferred = queue.drain().await.unwrap();
        assert!(deferred.lane("cart").unwrap().deferred);
        assert_eq!(transport.calls_to(CART), 2);

        clock.advance(Duration::from_secs(30));
        let report = queue.drain().await.unwrap();
        assert_eq!(report.replayed(), 2);
        assert_eq!(bodies(&transport, CART), ["o1", "o2", "o2", "o3"]);
    }

    #[tokio::test]
    async fn test_backoff_grows_with_attempts() {
        let (queue, transport, clock) = queue();
        transport.route(CART, FakeReply::Fail);
        queue.enqueue(op("cart", CART, "o1", 1_000)).unwrap();

        queue.drain().await.unwrap();
        let first = queue.pending("cart").unwrap()[0].next_attempt_at;
        clock.set(first);
        queue.drain().await.unwrap();
        let second = queue.pending("cart").unwrap()[0].clone();

        assert_eq!(second.attempts, 2);
        assert_eq!(second.next_attempt_at - first, 60_000);
    }

    #[tokio::test]
    async fn test_lanes_are_independent() {
        let (queue, transport, _) = queue();
        transport.route(CART, FakeReply::Fail);
        transport.respond(ANALYTICS, "");
        queue.enqueue(op("cart", CART, "c1", 1_000)).unwrap();
        queue.enqueue(op("analytics", ANALYTICS, "a1", 1_000)).unwrap();
        queue.enqueue(op("analytics", ANALYTICS, "a2", 1_000)).unwrap();

        let report = queue.drain().await.unwrap();
        assert_eq!(report.lane("analytics").unwrap().replayed, 2);
        assert_eq!(report.lane("cart").unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn test_connectivity_restored_clears_backoff() {
        let (queue, transport, _) = queue();
        transport.set_offline(true);
        queue.enqueue(op("cart", CART, "o1", 1_000)).unwrap();
        queue.drain().await.unwrap();
        assert_eq!(queue.pending("cart").unwrap()[0].attempts, 1);

        transport.set_offline(false);
        transport.respond(CART, "");
        let report = queue.connectivity_restored().await.unwrap();
        assert_eq!(report.replayed(), 1);
        assert!(queue.pending_counts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_drains_replay_once() {
        let (queue, transport, _) = queue();
        transport.route(
            CART,
            FakeReply::Delayed(Duration::from_millis(20), Box::new(FakeReply::ok(""))),
        );
        queue.enqueue(op("cart", CART, "o1", 1_000)).unwrap();
        queue.enqueue(op("cart", CART, "o2", 1_000)).unwrap();

        let (a, b) = tokio::join!(queue.drain(), queue.drain());
        assert_eq!(a.unwrap().replayed() + b.unwrap().replayed(), 2);
        assert_eq!(bodies(&transport, CART), ["o1", "o2"]);
    }

    #[tokio::test]
    async fn test_hanging_replay_times_out_as_failure() {
        let (queue, transport, _) = queue();
        transport.route(CART, FakeReply::Hang);
        queue.enqueue(op("cart", CART, "o1", 1_000)).unwrap();

        let report = queue.drain().await.unwrap();
        let failed = report.lane("cart").unwrap().failed.clone().unwrap();
        assert!(failed.reason.contains("timed out"));
    }
}
