//! Versioned install and activation.
//!
//! A version moves `Installing -> Waiting -> Activating -> Active`, or to
//! `Redundant` when its install fails or a newer version replaces it.
//! Install and activation are serialized; neither is cancellable.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use offkit_common::{retry_with_backoff, with_timeout, Clock, RetryConfig};
use offkit_net::{NetRequest, Transport};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::engine::EngineEvent;
use crate::error::{EngineError, EngineResult, StoreError};
use crate::partition::{PartitionKey, PartitionRegistry, PartitionSet, PartitionStore};
use crate::store::CacheEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Installing,
    Waiting,
    Activating,
    Active,
    Redundant,
}

/// What install needs to know.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    /// Absolute URLs written to the precache partition.
    pub manifest: Vec<Url>,
    /// Absolute URL written to the offline partition.
    pub offline_document: Option<Url>,
    pub network_timeout: Duration,
    /// Retry applied to each URL.
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub version: String,
    pub state: LifecycleState,
    /// Entries written during this install.
    pub precached: usize,
    /// Entries that were already stored and reused.
    pub reused: usize,
}

/// Result of a fetch-and-store of explicit URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecacheReport {
    pub stored: usize,
    pub failed: Vec<String>,
}

struct Fetched {
    partition: PartitionKey,
    url: String,
    outcome: Result<CacheEntry, String>,
}

pub struct LifecycleController {
    registry: Arc<PartitionRegistry>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    plan: InstallPlan,
    states: Mutex<BTreeMap<String, LifecycleState>>,
    waiting: Mutex<Option<Arc<PartitionSet>>>,
    clients: Mutex<HashSet<String>>,
    transition: tokio::sync::Mutex<()>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<PartitionRegistry>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        plan: InstallPlan,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            registry,
            transport,
            clock,
            plan,
            states: Mutex::new(BTreeMap::new()),
            waiting: Mutex::new(None),
            clients: Mutex::new(HashSet::new()),
            transition: tokio::sync::Mutex::new(()),
            events,
        }
    }

    pub fn registry(&self) -> &Arc<PartitionRegistry> {
        &self.registry
    }

    pub fn state(&self, version: &str) -> Option<LifecycleState> {
        self.states.lock().get(version).copied()
    }

    pub fn states(&self) -> BTreeMap<String, LifecycleState> {
        self.states.lock().clone()
    }

    pub fn waiting_version(&self) -> Option<String> {
        self.waiting.lock().as_ref().map(|s| s.version().to_string())
    }

    pub async fn active_version(&self) -> Option<String> {
        self.registry.active_version().await
    }

    /// Install `version`: open its partitions and precache the manifest,
    /// all or nothing. The first version ever installed activates at once.
    pub async fn install(&self, version: &str) -> EngineResult<InstallReport> {
        let _transition = self.transition.lock().await;

        if self.registry.active_version().await.as_deref() == Some(version) {
            debug!(version, "Version already active");
            return Ok(self.report(version, LifecycleState::Active, 0, 0));
        }
        if self.waiting_version().as_deref() == Some(version) {
            debug!(version, "Version already waiting");
            return Ok(self.report(version, LifecycleState::Waiting, 0, 0));
        }

        self.set_state(version, LifecycleState::Installing);
        info!(version, manifest = self.plan.manifest.len(), "Installing");

        let (set, created) = match self.registry.open_set(version) {
            Ok(opened) => opened,
            Err(e) => {
                self.set_state(version, LifecycleState::Redundant);
                return Err(e.into());
            }
        };

        let (precached, reused) = match self.precache_set(&set).await {
            Ok(counts) => counts,
            Err(e) => {
                let removed = self.registry.delete_partitions(&created);
                warn!(version, removed, error = %e, "Install failed, rolled back");
                self.set_state(version, LifecycleState::Redundant);
                return Err(e);
            }
        };

        self.set_state(version, LifecycleState::Waiting);
        let replaced = self.waiting.lock().replace(Arc::clone(&set));
        if let Some(replaced) = replaced {
            if replaced.version() != version {
                self.set_state(replaced.version(), LifecycleState::Redundant);
            }
        }
        info!(version, precached, reused, "Installed");

        if self.registry.active_version().await.is_none() {
            self.activate_waiting().await?;
        }
        let state = self.state(version).unwrap_or(LifecycleState::Waiting);
        Ok(self.report(version, state, precached, reused))
    }

    /// Activate the waiting version regardless of clients. A no-op when
    /// nothing is waiting.
    pub async fn force_activate(&self) -> EngineResult<Option<String>> {
        let _transition = self.transition.lock().await;
        self.activate_waiting().await
    }

    /// Record a client using the active version.
    pub fn claim_client(&self, client_id: &str) {
        if self.clients.lock().insert(client_id.to_string()) {
            debug!(client = client_id, "Client claimed");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Forget a client. The last release activates a waiting version.
    pub async fn release_client(&self, client_id: &str) -> EngineResult<Option<String>> {
        let remaining = {
            let mut clients = self.clients.lock();
            clients.remove(client_id);
            clients.len()
        };
        if remaining > 0 || self.waiting.lock().is_none() {
            return Ok(None);
        }
        let _transition = self.transition.lock().await;
        if self.client_count() > 0 {
            return Ok(None);
        }
        self.activate_waiting().await
    }

    /// Fetch URLs into the active precache partition.
    pub async fn precache(&self, urls: &[Url]) -> EngineResult<PrecacheReport> {
        let lease = self.registry.lease().await.ok_or(EngineError::NoActiveVersion)?;
        let fetched = self.fetch_all(urls.iter().map(|u| (PartitionKey::Precache, u))).await;

        let mut report = PrecacheReport::default();
        let mut entries = Vec::new();
        for item in fetched {
            match item.outcome {
                Ok(entry) => entries.push(entry),
                Err(reason) => {
                    warn!(url = %item.url, reason = %reason, "Precache fetch failed");
                    report.failed.push(item.url);
                }
            }
        }
        report.stored = entries.len();
        lease.store(PartitionKey::Precache).put_all(entries)?;
        info!(stored = report.stored, failed = report.failed.len(), "Precached URLs");
        Ok(report)
    }

    /// Remove expired entries from every partition of the active version.
    pub async fn prune_expired(&self) -> EngineResult<usize> {
        let Some(lease) = self.registry.lease().await else {
            return Ok(0);
        };
        Ok(prune_set(&lease, self.clock.now()))
    }

    /// Delete every retired partition and empty the active ones.
    pub async fn purge_all(&self) -> EngineResult<usize> {
        let _transition = self.transition.lock().await;
        let mut removed = 0;
        match self.registry.lease().await {
            Some(lease) => {
                removed += self.registry.delete_other_versions(lease.version())?.len();
                for store in lease.stores() {
                    removed += store.clear()?;
                }
            }
            None => {
                removed += self.registry.delete_other_versions("")?.len();
            }
        }
        let waiting = self.waiting.lock().take();
        if let Some(waiting) = waiting {
            self.set_state(waiting.version(), LifecycleState::Redundant);
        }
        info!(removed, "Purged partitions");
        Ok(removed)
    }

    async fn activate_waiting(&self) -> EngineResult<Option<String>> {
        let Some(set) = self.waiting.lock().take() else {
            debug!("Nothing waiting to activate");
            return Ok(None);
        };
        let version = set.version().to_string();
        self.set_state(&version, LifecycleState::Activating);

        let previous = self.registry.swap(Arc::clone(&set)).await;
        let previous_version = previous.as_ref().map(|p| p.version().to_string());
        if let Some(previous) = previous {
            debug!(version = previous.version(), in_flight = previous.in_flight(), "Waiting for in-flight requests");
            previous.wait_idle().await;
            self.set_state(previous.version(), LifecycleState::Redundant);
        }

        let deleted = self.registry.delete_other_versions(&version)?;
        self.clients.lock().clear();
        self.set_state(&version, LifecycleState::Active);
        info!(version = %version, previous = ?previous_version, deleted = deleted.len(), "Activated");
        self.emit(EngineEvent::Activated {
            version: version.clone(),
            previous: previous_version,
        });

        let pruned = prune_set(&set, self.clock.now());
        if pruned > 0 {
            debug!(version = %version, pruned, "Pruned expired entries after activation");
        }
        Ok(Some(version))
    }

    /// Fetch the manifest and offline document and write them in one batch
    /// per partition. URLs that fail but were stored by an earlier completed
    /// install of the same version are reused.
    async fn precache_set(&self, set: &PartitionSet) -> EngineResult<(usize, usize)> {
        let targets = self
            .plan
            .manifest
            .iter()
            .map(|u| (PartitionKey::Precache, u))
            .chain(self.plan.offline_document.iter().map(|u| (PartitionKey::Offline, u)));
        let fetched = self.fetch_all(targets).await;

        let mut precache = Vec::new();
        let mut offline = Vec::new();
        let mut failed = Vec::new();
        let mut reused = 0;
        for item in fetched {
            match item.outcome {
                Ok(entry) if item.partition == PartitionKey::Offline => offline.push(entry),
                Ok(entry) => precache.push(entry),
                Err(reason) => {
                    if set.store(item.partition).lookup(&item.url)?.is_some() {
                        debug!(url = %item.url, reason = %reason, "Reusing stored entry");
                        reused += 1;
                    } else {
                        warn!(url = %item.url, reason = %reason, "Manifest fetch failed");
                        failed.push(item.url);
                    }
                }
            }
        }
        if !failed.is_empty() {
            return Err(EngineError::InstallManifestFailure {
                version: set.version().to_string(),
                failed,
            });
        }

        let written = precache.len() + offline.len();
        let precache_store = set.store(PartitionKey::Precache);
        let previous = precache
            .iter()
            .map(|entry| Ok((entry.url.clone(), precache_store.lookup(&entry.url)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        precache_store.put_all(precache)?;
        if let Err(e) = set.store(PartitionKey::Offline).put_all(offline) {
            restore(precache_store, previous);
            return Err(e.into());
        }
        Ok((written, reused))
    }

    async fn fetch_all<'a>(&self, targets: impl Iterator<Item = (PartitionKey, &'a Url)>) -> Vec<Fetched> {
        join_all(targets.map(|(partition, url)| async move {
            Fetched {
                partition,
                url: url.to_string(),
                outcome: self.fetch_entry(url).await,
            }
        }))
        .await
    }

    async fn fetch_entry(&self, url: &Url) -> Result<CacheEntry, String> {
        let timeout = self.plan.network_timeout;
        retry_with_backoff(&self.plan.retry, move || async move {
            let request = NetRequest::get(url.clone()).timeout(timeout);
            let response = with_timeout(timeout, self.transport.fetch(request))
                .await
                .map_err(|e| e.to_string())?
                .map_err(|e| e.to_string())?;
            if !response.ok() {
                return Err(format!("{url} answered {}", response.status));
            }
            Ok::<_, String>(CacheEntry::from_response(url.as_str(), &response, self.clock.now()))
        })
        .await
    }

    fn set_state(&self, version: &str, state: LifecycleState) {
        let changed = self.states.lock().insert(version.to_string(), state) != Some(state);
        if changed {
            debug!(version, ?state, "Lifecycle state changed");
            self.emit(EngineEvent::StateChanged {
                version: version.to_string(),
                state,
            });
        }
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, version: &str, state: LifecycleState, precached: usize, reused: usize) -> InstallReport {
        InstallReport {
            version: version.to_string(),
            state,
            precached,
            reused,
        }
    }
}

/// Put back what a partially committed batch overwrote.
fn restore(store: &PartitionStore, previous: Vec<(String, Option<CacheEntry>)>) {
    for (url, entry) in previous {
        let outcome = match entry {
            Some(entry) => store.put_all(vec![entry]),
            None => store.delete(&url).map(|_| ()),
        };
        if let Err(e) = outcome {
            warn!(url = %url, partition = store.name(), error = %e, "Failed to restore precache entry");
        }
    }
}

fn prune_set(set: &PartitionSet, now: offkit_common::Timestamp) -> usize {
    set.stores()
        .iter()
        .map(|store| match store.prune_expired(now) {
            Ok(n) => n,
            Err(e) => {
                warn!(partition = store.name(), error = %e, "Prune failed");
                0
            }
        })
        .sum()
}
