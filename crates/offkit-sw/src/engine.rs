//! The engine facade.

use std::sync::Arc;

use bytes::Bytes;
use offkit_common::{Clock, RetryConfig, SystemClock};
use offkit_net::{HttpTransport, LoaderConfig, Transport};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::classify::{Classification, RequestClassifier};
use crate::config::EngineConfig;
use crate::control::{serve_control, ControlClient, ControlMessage, ControlReply};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{InstallPlan, InstallReport, LifecycleController, LifecycleState};
use crate::notify::{Interaction, NavigationIntent, NotificationBridge, NotificationDescriptor};
use crate::partition::PartitionRegistry;
use crate::request::{DestinationType, FetchEvent, RequestDescriptor, RequestMode};
use crate::store::{CacheBackend, SqliteStore};
use crate::strategy::{EngineResponse, StrategyError, StrategyExecutor};
use crate::sync::{DrainReport, OutboundSyncQueue, QueueStore, QueuedOperation};

/// Events for the hosting application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StateChanged { version: String, state: LifecycleState },
    Activated { version: String, previous: Option<String> },
    ShowNotification(NotificationDescriptor),
    NavigationIntent(NavigationIntent),
    Queued { lane: String, id: Uuid },
    Drained { replayed: usize, remaining: usize },
}

/// Builder for [`OfflineEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<Arc<dyn CacheBackend>>,
    queue: Option<Arc<dyn QueueStore>>,
    clock: Option<Arc<dyn Clock>>,
    install_retry: Option<RetryConfig>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transport: None,
            cache: None,
            queue: None,
            clock: None,
            install_retry: None,
        }
    }

    /// Use a transport instead of the default `reqwest` one.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cache_backend(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn queue_store(mut self, queue: Arc<dyn QueueStore>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Use one SQLite store for both partitions and the queue.
    pub fn sqlite(self, store: Arc<SqliteStore>) -> Self {
        self.cache_backend(store.clone()).queue_store(store)
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Retry applied to each manifest URL during install.
    pub fn install_retry(mut self, retry: RetryConfig) -> Self {
        self.install_retry = Some(retry);
        self
    }

    /// Build the engine. Backends not set explicitly share a SQLite store
    /// under the configured data directory.
    pub fn build(self) -> EngineResult<(OfflineEngine, mpsc::UnboundedReceiver<EngineEvent>)> {
        let config = self.config;
        config.validate()?;
        let base_url = config.base_url()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(LoaderConfig {
                default_timeout: config.network_timeout(),
                ..Default::default()
            })?),
        };
        let (cache, queue) = match (self.cache, self.queue) {
            (Some(cache), Some(queue)) => (cache, queue),
            (cache, queue) => {
                let path = config.database_path();
                info!(path = %path.display(), "Opening SQLite store");
                let store = Arc::new(SqliteStore::open(&path)?);
                (
                    cache.unwrap_or_else(|| store.clone()),
                    queue.unwrap_or_else(|| store.clone()),
                )
            }
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let resolve = |raw: &str| {
            base_url
                .join(raw)
                .map_err(|e| EngineError::InvalidRequest(format!("{raw}: {e}")))
        };
        let manifest = config
            .precache_manifest
            .iter()
            .map(|raw| resolve(raw.as_str()))
            .collect::<EngineResult<Vec<_>>>()?;
        let offline_document = resolve(config.offline_document_url.as_str())?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(PartitionRegistry::new(cache, config.partitions.policies()));
        let plan = InstallPlan {
            manifest,
            offline_document: Some(offline_document.clone()),
            network_timeout: config.network_timeout(),
            retry: self.install_retry.unwrap_or_else(|| RetryConfig {
                max_attempts: config.install_attempts,
                ..Default::default()
            }),
        };
        let lifecycle = LifecycleController::new(
            Arc::clone(&registry),
            Arc::clone(&transport),
            Arc::clone(&clock),
            plan,
            events_tx.clone(),
        );
        let executor = StrategyExecutor::new(Arc::clone(&transport), Arc::clone(&clock), config.network_timeout())
            .with_offline_document(&offline_document);
        let sync = OutboundSyncQueue::new(
            queue,
            transport,
            Arc::clone(&clock),
            config.sync.retry(),
            config.network_timeout(),
        );

        let engine = OfflineEngine {
            classifier: RequestClassifier::new(&config.classifier),
            notifications: NotificationBridge::new(config.notifications.clone()),
            base_url,
            registry,
            lifecycle,
            executor,
            sync,
            clock,
            events: events_tx,
            config,
        };
        Ok((engine, events_rx))
    }
}

/// Offline request interception and caching engine.
pub struct OfflineEngine {
    config: EngineConfig,
    base_url: Url,
    classifier: RequestClassifier,
    registry: Arc<PartitionRegistry>,
    lifecycle: LifecycleController,
    executor: StrategyExecutor,
    sync: OutboundSyncQueue,
    notifications: NotificationBridge,
    clock: Arc<dyn Clock>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl OfflineEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn classifier(&self) -> &RequestClassifier {
        &self.classifier
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<PartitionRegistry> {
        &self.registry
    }

    pub fn sync_queue(&self) -> &OutboundSyncQueue {
        &self.sync
    }

    /// Install the configured version.
    pub async fn start(&self) -> EngineResult<InstallReport> {
        info!(version = %self.config.version, base_url = %self.base_url, "Starting offline engine");
        self.lifecycle.install(&self.config.version).await
    }

    /// Build a request descriptor against the configured base URL.
    pub fn request(
        &self,
        raw_url: &str,
        method: &str,
        destination: DestinationType,
        mode: RequestMode,
    ) -> EngineResult<RequestDescriptor> {
        RequestDescriptor::resolve(raw_url, &self.base_url, method, destination, mode)
    }

    /// Serve an intercepted request. Only bypassed and network-only
    /// requests can fail; everything else resolves to a response.
    pub async fn handle_fetch(&self, event: FetchEvent) -> EngineResult<EngineResponse> {
        let decided = self.classifier.explain(&event.request);
        debug!(url = %event.request.url(), method = event.request.method(), rule = %decided, "Classified");
        if let Some(client) = &event.client_id {
            self.lifecycle.claim_client(client);
        }

        let Classification::Route { partition, strategy } = decided.classification else {
            return self.bypass(&event).await;
        };

        let Some(lease) = self.registry.lease().await else {
            debug!(url = %event.request.url(), "No active version, going to network");
            return Ok(match self.executor.network_only(&event).await {
                Ok(response) => response,
                Err(_) if event.request.is_navigation() => EngineResponse::builtin_offline(),
                Err(_) => EngineResponse::unavailable(Some(partition)),
            });
        };

        match self.executor.execute(&lease, partition, strategy, &event).await {
            Ok(response) => Ok(response),
            Err(e) => match EngineError::from(e) {
                EngineError::CacheMiss(url) => {
                    debug!(url = %url, "Synthesizing unavailable response");
                    Ok(EngineResponse::unavailable(Some(partition)))
                }
                other => Err(other),
            },
        }
    }

    /// Pass a request straight through. Writes to a sync lane that never
    /// reached the network are queued instead. A timed-out write may have
    /// been applied, so it propagates rather than being replayed.
    async fn bypass(&self, event: &FetchEvent) -> EngineResult<EngineResponse> {
        let error = match self.executor.network_only(event).await {
            Ok(response) => return Ok(response),
            Err(StrategyError::Network(e)) => e,
            Err(StrategyError::Unavailable { .. }) => return Ok(EngineResponse::unavailable(None)),
        };

        let lane = (!event.request.is_get() && error.is_unreachable())
            .then(|| self.config.sync.lane_for(event.request.path()))
            .flatten();
        let Some(lane) = lane else {
            return Err(EngineError::from_transport(error));
        };

        let op = QueuedOperation::new(
            lane.name.as_str(),
            event.request.url().as_str(),
            event.request.method(),
            event.body.clone().unwrap_or_else(Bytes::new),
            self.clock.now(),
        )
        .with_headers(event.headers.clone());
        let op = self.sync.enqueue(op)?;
        self.emit(EngineEvent::Queued {
            lane: op.lane.clone(),
            id: op.id,
        });
        Ok(EngineResponse::queued(&op.lane, op.id))
    }

    /// Translate a push payload and ask the host to show it.
    pub fn handle_push(&self, payload: &[u8]) -> NotificationDescriptor {
        let notification = self.notifications.descriptor(payload);
        debug!(title = %notification.title, tag = ?notification.tag, "Push received");
        self.emit(EngineEvent::ShowNotification(notification.clone()));
        notification
    }

    pub fn handle_notification_interaction(
        &self,
        notification: &NotificationDescriptor,
        interaction: &Interaction,
    ) -> Option<NavigationIntent> {
        let intent = self.notifications.intent(notification, interaction)?;
        self.emit(EngineEvent::NavigationIntent(intent.clone()));
        Some(intent)
    }

    /// The network is back: clear backoff and drain the sync queue.
    pub async fn connectivity_restored(&self) -> EngineResult<DrainReport> {
        let report = self.sync.connectivity_restored().await?;
        self.emit(EngineEvent::Drained {
            replayed: report.replayed(),
            remaining: report.remaining(),
        });
        Ok(report)
    }

    /// Drain lanes whose head is due.
    pub async fn drain_queue(&self) -> EngineResult<DrainReport> {
        Ok(self.sync.drain().await?)
    }

    /// A client went away. Returns the version activated as a result.
    pub async fn release_client(&self, client_id: &str) -> EngineResult<Option<String>> {
        self.lifecycle.release_client(client_id).await
    }

    /// Wait for background revalidations.
    pub async fn settle(&self) {
        self.executor.settle().await;
    }

    pub async fn handle_control(&self, message: ControlMessage) -> ControlReply {
        match self.try_control(message).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, category = e.category(), "Control message failed");
                ControlReply::Error { message: e.to_string() }
            }
        }
    }

    async fn try_control(&self, message: ControlMessage) -> EngineResult<ControlReply> {
        Ok(match message {
            ControlMessage::ForceActivate => ControlReply::Activated {
                version: self.lifecycle.force_activate().await?,
            },
            ControlMessage::QueryVersion => ControlReply::Version {
                active: self.lifecycle.active_version().await,
                waiting: self.lifecycle.waiting_version(),
            },
            ControlMessage::PurgeAllPartitions => ControlReply::Purged {
                removed: self.lifecycle.purge_all().await?,
            },
            ControlMessage::Precache { urls } => {
                let urls = urls
                    .iter()
                    .map(|raw| {
                        self.base_url
                            .join(raw)
                            .map_err(|e| EngineError::InvalidRequest(format!("{raw}: {e}")))
                    })
                    .collect::<EngineResult<Vec<_>>>()?;
                let report = self.lifecycle.precache(&urls).await?;
                ControlReply::Precached {
                    stored: report.stored,
                    failed: report.failed,
                }
            }
            ControlMessage::PruneExpired => ControlReply::Pruned {
                removed: self.lifecycle.prune_expired().await?,
            },
            ControlMessage::QueueStatus => ControlReply::QueueStatus {
                pending: self.sync.pending_counts()?,
            },
        })
    }

    /// Serve the control channel on a background task.
    pub fn control_channel(self: &Arc<Self>, capacity: usize) -> ControlClient {
        let (client, rx) = ControlClient::channel(capacity);
        tokio::spawn(serve_control(Arc::clone(self), rx));
        client
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}
