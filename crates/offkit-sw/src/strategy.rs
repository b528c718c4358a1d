//! Strategy execution.
//!
//! Each strategy is an async chain of network attempts and partition
//! lookups. Every failure inside a chain is absorbed; what leaves
//! [`StrategyExecutor::execute`] is either a response or one of two typed
//! failures: [`StrategyError::Unavailable`] (nothing servable) or
//! [`StrategyError::Network`] (network-only requests).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use http::{Method, StatusCode};
use offkit_common::{with_timeout, Clock};
use offkit_net::{NetError, NetRequest, NetResponse, Transport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::classify::Strategy;
use crate::freshness::Freshness;
use crate::partition::{PartitionKey, PartitionLease, PartitionStore};
use crate::request::FetchEvent;
use crate::store::CacheEntry;

/// Built-in document served when no offline document was cached.
pub const BUILTIN_OFFLINE_DOCUMENT: &str = "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page is not available offline. \
Check your connection and try again.</p></body></html>";

const UNAVAILABLE_IMAGE: &str = "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"400\" height=\"300\" \
viewBox=\"0 0 400 300\"><rect width=\"400\" height=\"300\" fill=\"#e5e7eb\"/>\
<text x=\"200\" y=\"155\" text-anchor=\"middle\" font-family=\"sans-serif\" font-size=\"18\" \
fill=\"#6b7280\">Image unavailable offline</text></svg>";

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Network,
    Cache,
    /// Offline document (cached or built in).
    OfflineFallback,
    /// Synthesized because nothing was servable.
    Unavailable,
    /// Write accepted into the sync queue.
    Queued,
}

/// Response handed back to the host.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub source: ResponseSource,
    /// Freshness of the served entry, for cache hits.
    pub freshness: Option<Freshness>,
    /// Physical partition the response was read from or written to.
    pub partition: Option<String>,
}

impl EngineResponse {
    pub fn from_network(response: NetResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            source: ResponseSource::Network,
            freshness: None,
            partition: None,
        }
    }

    pub fn from_entry(entry: CacheEntry, store: &PartitionStore, freshness: Freshness) -> Self {
        Self {
            status: StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
            headers: entry.headers,
            body: entry.payload,
            source: ResponseSource::Cache,
            freshness: Some(freshness),
            partition: Some(store.name().to_string()),
        }
    }

    /// The built-in offline document.
    pub fn builtin_offline() -> Self {
        Self {
            status: StatusCode::OK,
            headers: content_type("text/html; charset=utf-8"),
            body: Bytes::from_static(BUILTIN_OFFLINE_DOCUMENT.as_bytes()),
            source: ResponseSource::OfflineFallback,
            freshness: None,
            partition: None,
        }
    }

    /// `503` for a request nothing could serve. Requests routed to the
    /// images partition get a placeholder.
    pub fn unavailable(partition: Option<PartitionKey>) -> Self {
        let (kind, body) = if partition == Some(PartitionKey::Images) {
            ("image/svg+xml", Bytes::from_static(UNAVAILABLE_IMAGE.as_bytes()))
        } else {
            ("text/plain; charset=utf-8", Bytes::from_static(b"Service Unavailable"))
        };
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            headers: content_type(kind),
            body,
            source: ResponseSource::Unavailable,
            freshness: None,
            partition: None,
        }
    }

    /// `202 Accepted` for a write parked in the sync queue.
    pub fn queued(lane: &str, id: uuid::Uuid) -> Self {
        let body = serde_json::json!({ "queued": true, "lane": lane, "id": id.to_string() });
        Self {
            status: StatusCode::ACCEPTED,
            headers: content_type("application/json"),
            body: Bytes::from(body.to_string()),
            source: ResponseSource::Queued,
            freshness: None,
            partition: None,
        }
    }

    fn in_partition(mut self, store: &PartitionStore) -> Self {
        self.partition = Some(store.name().to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn content_type(value: &str) -> HashMap<String, String> {
    HashMap::from([("content-type".to_string(), value.to_string())])
}

/// Failure left after a strategy's fallback chain ran out.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Nothing servable for {url}")]
    Unavailable { url: String },

    #[error(transparent)]
    Network(#[from] NetError),
}

/// Runs strategies against a leased partition set.
pub struct StrategyExecutor {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    network_timeout: Duration,
    offline_document_url: Option<String>,
    revalidations: Mutex<Vec<JoinHandle<()>>>,
}

impl StrategyExecutor {
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, network_timeout: Duration) -> Self {
        Self {
            transport,
            clock,
            network_timeout,
            offline_document_url: None,
            revalidations: Mutex::new(Vec::new()),
        }
    }

    /// Absolute URL of the offline document in the offline partition.
    pub fn with_offline_document(mut self, url: &Url) -> Self {
        self.offline_document_url = Some(url.to_string());
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn network_timeout(&self) -> Duration {
        self.network_timeout
    }

    pub async fn execute(
        &self,
        lease: &PartitionLease,
        partition: PartitionKey,
        strategy: Strategy,
        event: &FetchEvent,
    ) -> Result<EngineResponse, StrategyError> {
        let store = lease.store(partition);
        debug!(url = %event.request.url(), partition = store.name(), ?strategy, "Executing strategy");
        match strategy {
            Strategy::CacheFirst => self.cache_first(store, event).await,
            Strategy::NetworkFirstThenCache
            | Strategy::NetworkFirstWithShortTtlFallback
            | Strategy::NetworkFirstWithCacheFallback => self.network_first(store, event).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(lease, store, event).await,
            Strategy::NavigationFallback => Ok(self.navigation_fallback(lease, event).await),
            Strategy::NetworkOnly => self.network_only(event).await,
        }
    }

    /// Straight to the network with no store interaction.
    pub async fn network_only(&self, event: &FetchEvent) -> Result<EngineResponse, StrategyError> {
        let response = self.fetch(event).await?;
        Ok(EngineResponse::from_network(response))
    }

    /// One network attempt under the executor timeout.
    pub async fn fetch(&self, event: &FetchEvent) -> Result<NetResponse, NetError> {
        let request = net_request(event, self.network_timeout)?;
        attempt(self.transport.as_ref(), request, self.network_timeout).await
    }

    /// Wait for spawned revalidations to finish.
    pub async fn settle(&self) {
        loop {
            let handles = std::mem::take(&mut *self.revalidations.lock());
            if handles.is_empty() {
                return;
            }
            for result in join_all(handles).await {
                if let Err(e) = result {
                    warn!(error = %e, "Revalidation task failed");
                }
            }
        }
    }

    async fn cache_first(
        &self,
        store: &PartitionStore,
        event: &FetchEvent,
    ) -> Result<EngineResponse, StrategyError> {
        let key = event.request.cache_key();
        let cached = lookup(store, &key);
        if let Some(entry) = &cached {
            let freshness = store.freshness(entry, self.clock.now());
            if freshness == Freshness::Fresh {
                debug!(url = %key, partition = store.name(), "Cache hit");
                return Ok(EngineResponse::from_entry(entry.clone(), store, freshness));
            }
            debug!(url = %key, ?freshness, "Cached entry not fresh, trying network");
        }

        match self.fetch(event).await {
            Ok(response) if response.ok() => Ok(self.persist(store, &key, response)),
            outcome => self.fall_back(store, &key, cached, outcome),
        }
    }

    async fn network_first(
        &self,
        store: &PartitionStore,
        event: &FetchEvent,
    ) -> Result<EngineResponse, StrategyError> {
        let key = event.request.cache_key();
        match self.fetch(event).await {
            Ok(response) if response.ok() => Ok(self.persist(store, &key, response)),
            outcome => {
                let cached = lookup(store, &key);
                self.fall_back(store, &key, cached, outcome)
            }
        }
    }

    async fn stale_while_revalidate(
        &self,
        lease: &PartitionLease,
        store: &PartitionStore,
        event: &FetchEvent,
    ) -> Result<EngineResponse, StrategyError> {
        let key = event.request.cache_key();
        let Some(entry) = lookup(store, &key) else {
            debug!(url = %key, "Nothing cached, revalidating inline");
            return self.network_first(store, event).await;
        };

        let freshness = store.freshness(&entry, self.clock.now());
        self.spawn_revalidation(lease.clone(), store.key(), event)?;
        Ok(EngineResponse::from_entry(entry, store, freshness))
    }

    fn spawn_revalidation(
        &self,
        lease: PartitionLease,
        partition: PartitionKey,
        event: &FetchEvent,
    ) -> Result<(), StrategyError> {
        let request = net_request(event, self.network_timeout)?;
        let key = event.request.cache_key();
        let transport = Arc::clone(&self.transport);
        let clock = Arc::clone(&self.clock);
        let timeout = self.network_timeout;

        let handle = tokio::spawn(async move {
            let store = lease.store(partition);
            match attempt(transport.as_ref(), request, timeout).await {
                Ok(response) if response.ok() => {
                    let entry = CacheEntry::from_response(key.as_str(), &response, clock.now());
                    match store.put(entry) {
                        Ok(()) => debug!(url = %key, partition = store.name(), "Revalidated"),
                        Err(e) => warn!(url = %key, error = %e, "Failed to store revalidated entry"),
                    }
                }
                Ok(response) => debug!(url = %key, status = %response.status, "Revalidation not stored"),
                Err(e) => debug!(url = %key, error = %e, "Revalidation failed"),
            }
        });

        let mut handles = self.revalidations.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    /// Never fails: falls back through cached documents to the built-in one.
    async fn navigation_fallback(&self, lease: &PartitionLease, event: &FetchEvent) -> EngineResponse {
        let runtime = lease.store(PartitionKey::Runtime);
        let key = event.request.cache_key();
        match self.fetch(event).await {
            Ok(response) if response.ok() => return self.persist(runtime, &key, response),
            Ok(response) => debug!(url = %key, status = %response.status, "Navigation answered non-2xx, walking fallback chain"),
            Err(e) => debug!(url = %key, error = %e, "Navigation failed, walking fallback chain"),
        }

        let precache = lease.store(PartitionKey::Precache);
        let root = event.request.root_key();
        let mut chain: Vec<(&PartitionStore, &str)> = vec![(runtime, key.as_str()), (precache, key.as_str())];
        if let Some(root) = root.as_deref() {
            chain.push((runtime, root));
            chain.push((precache, root));
        }
        for (store, candidate) in chain {
            if let Some(entry) = lookup(store, candidate) {
                debug!(url = %candidate, partition = store.name(), "Navigation served from cache");
                return self.serve(entry, store);
            }
        }

        let offline = lease.store(PartitionKey::Offline);
        if let Some(entry) = self.offline_document_url.as_deref().and_then(|url| lookup(offline, url)) {
            let mut response = self.serve(entry, offline);
            response.source = ResponseSource::OfflineFallback;
            return response;
        }
        EngineResponse::builtin_offline()
    }

    fn serve(&self, entry: CacheEntry, store: &PartitionStore) -> EngineResponse {
        let freshness = store.freshness(&entry, self.clock.now());
        EngineResponse::from_entry(entry, store, freshness)
    }

    /// Cached entry regardless of freshness, else unavailable. A non-2xx
    /// answer counts as a failed attempt.
    fn fall_back(
        &self,
        store: &PartitionStore,
        key: &str,
        cached: Option<CacheEntry>,
        outcome: Result<NetResponse, NetError>,
    ) -> Result<EngineResponse, StrategyError> {
        if let Some(entry) = cached {
            debug!(url = %key, partition = store.name(), "Serving cached fallback");
            return Ok(self.serve(entry, store));
        }
        match outcome {
            Ok(response) => debug!(url = %key, status = %response.status, "No fallback for non-2xx answer"),
            Err(e) => debug!(url = %key, error = %e, "No fallback available"),
        }
        Err(StrategyError::Unavailable { url: key.to_string() })
    }

    /// Store a 2xx response; a failed write is logged and the response
    /// still returned.
    fn persist(&self, store: &PartitionStore, key: &str, response: NetResponse) -> EngineResponse {
        let entry = CacheEntry::from_response(key, &response, self.clock.now());
        if let Err(e) = store.put(entry) {
            warn!(url = %key, partition = store.name(), error = %e, "Failed to store response");
        }
        EngineResponse::from_network(response).in_partition(store)
    }
}

/// Read an entry, treating a backend error as a miss.
fn lookup(store: &PartitionStore, key: &str) -> Option<CacheEntry> {
    match store.lookup(key) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(url = %key, partition = store.name(), error = %e, "Cache read failed");
            None
        }
    }
}

fn net_request(event: &FetchEvent, timeout: Duration) -> Result<NetRequest, NetError> {
    let method = Method::from_bytes(event.request.method().as_bytes())
        .map_err(|_| NetError::RequestFailed(format!("invalid method {}", event.request.method())))?;
    let mut request = NetRequest::new(method, event.request.url().clone())
        .headers(event.headers.clone())
        .timeout(timeout);
    if let Some(body) = &event.body {
        request = request.body(body.clone());
    }
    Ok(request)
}

async fn attempt(
    transport: &dyn Transport,
    request: NetRequest,
    timeout: Duration,
) -> Result<NetResponse, NetError> {
    with_timeout(timeout, transport.fetch(request))
        .await
        .map_err(|_| NetError::Timeout(timeout))?
}
