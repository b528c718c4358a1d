//! # Offkit SW
//!
//! Offline-capable request interception and caching engine.
//!
//! ## Features
//!
//! - **Classification**: ordered rule table mapping requests to a partition and strategy
//! - **Strategies**: cache-first, network-first, stale-while-revalidate, navigation fallback
//! - **Partitions**: versioned, bounded stores with per-partition TTLs
//! - **Lifecycle**: atomic install, activation behind an in-flight barrier
//! - **Sync queue**: durable, lane-ordered replay of offline writes
//! - **Notifications**: push payloads to descriptors, clicks to navigation intents
//!
//! ## Architecture
//!
//! ```text
//! OfflineEngine
//!     │
//!     ├── RequestClassifier ──► Classification { partition, strategy } | Bypass
//!     ├── StrategyExecutor ───► Transport (offkit-net)
//!     │       └── PartitionLease ──► PartitionSet ──► PartitionStore ──► CacheBackend
//!     ├── LifecycleController
//!     │       └── PartitionRegistry (active set, versions)
//!     ├── OutboundSyncQueue ──► QueueStore
//!     └── NotificationBridge
//!
//! CacheBackend / QueueStore
//!     ├── MemoryBackend, MemoryQueueStore
//!     └── SqliteStore (both)
//! ```

pub mod classify;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod freshness;
pub mod lifecycle;
pub mod notify;
pub mod partition;
pub mod request;
pub mod store;
pub mod strategy;
pub mod sync;

pub use classify::{Classification, RequestClassifier, Rule, RuleMatch, RuleMatcher, Strategy};
pub use config::{
    ClassifierConfig, EngineConfig, LaneConfig, NotificationConfig, PartitionSettings,
    PartitionsConfig, SyncConfig,
};
pub use control::{serve_control, ControlClient, ControlMessage, ControlReply};
pub use engine::{EngineBuilder, EngineEvent, OfflineEngine};
pub use error::{EngineError, EngineResult, StoreError};
pub use freshness::{Freshness, FreshnessPolicy};
pub use lifecycle::{InstallPlan, InstallReport, LifecycleController, LifecycleState, PrecacheReport};
pub use notify::{
    Interaction, NavigationIntent, NotificationAction, NotificationBridge, NotificationDescriptor,
};
pub use partition::{
    PartitionKey, PartitionLease, PartitionName, PartitionPolicies, PartitionPolicy,
    PartitionRegistry, PartitionSet, PartitionStore,
};
pub use request::{DestinationType, FetchEvent, RequestDescriptor, RequestMode};
pub use store::{CacheBackend, CacheEntry, MemoryBackend, SqliteStore};
pub use strategy::{EngineResponse, ResponseSource, StrategyError, StrategyExecutor};
pub use sync::{
    DrainReport, LaneReport, MemoryQueueStore, OutboundSyncQueue, QueueStore, QueuedOperation,
};
