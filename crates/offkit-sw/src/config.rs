//! Engine configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use offkit_common::{CommonError, RetryConfig};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::classify::Strategy;
use crate::partition::{PartitionKey, PartitionPolicies, PartitionPolicy};
use crate::freshness::FreshnessPolicy;

/// Upper bound on `sync.max_backoff_secs`: one week.
pub const MAX_BACKOFF_SECS: u64 = 7 * 24 * 3600;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Version of the partition set this build installs
    pub version: String,

    /// Origin relative request URLs are resolved against
    pub base_url: String,

    /// Directory holding the SQLite store
    pub data_dir: PathBuf,

    /// Per-attempt network timeout in milliseconds
    pub network_timeout_ms: u64,

    /// URLs fetched into the precache partition on install
    pub precache_manifest: Vec<String>,

    /// Document served to navigations when nothing else is available
    pub offline_document_url: String,

    /// Attempts per manifest URL during install
    pub install_attempts: u32,

    /// Request classification
    pub classifier: ClassifierConfig,

    /// Partition TTLs and bounds
    pub partitions: PartitionsConfig,

    /// Outbound sync queue
    pub sync: SyncConfig,

    /// Push notification defaults
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Path prefix of API requests
    pub api_prefix: String,

    /// Extensions routed to the images partition
    pub image_extensions: Vec<String>,

    /// Extensions treated as static assets
    pub static_extensions: Vec<String>,

    /// Hosts that are never intercepted (`*.example.com`, `~fragment`, or exact)
    pub bypass_hosts: Vec<String>,

    /// Strategy for image requests
    pub image_strategy: Strategy,

    /// Strategy for static assets
    pub static_strategy: Strategy,
}

/// TTL and bound of one partition. A block given in config replaces the
/// default for that partition wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionSettings {
    /// TTL in seconds; absent means never expires
    pub ttl_secs: Option<u64>,

    /// Maximum entries before the oldest are evicted
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionsConfig {
    pub precache: PartitionSettings,
    pub runtime: PartitionSettings,
    pub images: PartitionSettings,
    pub api: PartitionSettings,
    pub offline: PartitionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Write lanes captured into the queue when offline
    pub lanes: Vec<LaneConfig>,

    /// Delay after the first failed replay, in seconds
    pub initial_backoff_secs: u64,

    /// Upper bound on replay backoff, in seconds
    pub max_backoff_secs: u64,

    /// Backoff growth per failure
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Lane name
    pub name: String,

    /// Request paths starting with this prefix belong to the lane
    pub path_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Title used when the payload has none
    pub default_title: String,

    /// Icon used when the payload has none
    pub default_icon: Option<String>,

    /// Badge used when the payload has none
    pub default_badge: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            base_url: "http://localhost/".to_string(),
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("offkit"),
            network_timeout_ms: 10_000,
            precache_manifest: vec!["/".to_string(), "/manifest.json".to_string()],
            offline_document_url: "/offline.html".to_string(),
            install_attempts: 3,
            classifier: ClassifierConfig::default(),
            partitions: PartitionsConfig::default(),
            sync: SyncConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let list = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            api_prefix: "/api/".to_string(),
            image_extensions: list(&["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif"]),
            static_extensions: list(&["js", "mjs", "css", "woff", "woff2", "ttf", "otf", "eot"]),
            bypass_hosts: list(&[
                "*.stripe.com",
                "*.stripe.network",
                "*.paypal.com",
                "*.braintreegateway.com",
                "*.amazonaws.com",
                "*.blob.core.windows.net",
                "storage.googleapis.com",
            ]),
            image_strategy: Strategy::NetworkFirstThenCache,
            static_strategy: Strategy::CacheFirst,
        }
    }
}

impl PartitionSettings {
    fn from_policy(policy: PartitionPolicy) -> Self {
        Self {
            ttl_secs: policy.freshness.ttl().map(|ttl| ttl.as_secs()),
            max_entries: policy.max_entries,
        }
    }

    fn to_policy(self) -> PartitionPolicy {
        PartitionPolicy {
            freshness: FreshnessPolicy::new(self.ttl_secs.map(Duration::from_secs)),
            max_entries: self.max_entries,
        }
    }
}

impl Default for PartitionsConfig {
    fn default() -> Self {
        let settings = |key| PartitionSettings::from_policy(PartitionPolicy::defaults(key));
        Self {
            precache: settings(PartitionKey::Precache),
            runtime: settings(PartitionKey::Runtime),
            images: settings(PartitionKey::Images),
            api: settings(PartitionKey::Api),
            offline: settings(PartitionKey::Offline),
        }
    }
}

impl PartitionsConfig {
    pub fn get(&self, key: PartitionKey) -> PartitionSettings {
        match key {
            PartitionKey::Precache => self.precache,
            PartitionKey::Runtime => self.runtime,
            PartitionKey::Images => self.images,
            PartitionKey::Api => self.api,
            PartitionKey::Offline => self.offline,
        }
    }

    pub fn policies(&self) -> PartitionPolicies {
        let mut policies = PartitionPolicies::default();
        for key in PartitionKey::ALL {
            policies.set(key, self.get(key).to_policy());
        }
        policies
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        let background = RetryConfig::background();
        Self {
            lanes: vec![
                LaneConfig::new("cart", "/api/cart"),
                LaneConfig::new("analytics", "/api/analytics"),
            ],
            initial_backoff_secs: background.initial_delay.as_secs(),
            max_backoff_secs: background.max_delay.as_secs(),
            backoff_multiplier: background.backoff_multiplier,
        }
    }
}

impl SyncConfig {
    /// Backoff applied between failed replays.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_secs(self.initial_backoff_secs),
            max_delay: Duration::from_secs(self.max_backoff_secs),
            backoff_multiplier: self.backoff_multiplier,
            ..RetryConfig::background()
        }
    }

    /// Lane a write to `path` belongs to.
    pub fn lane_for(&self, path: &str) -> Option<&LaneConfig> {
        self.lanes.iter().find(|lane| path.starts_with(&lane.path_prefix))
    }
}

impl LaneConfig {
    pub fn new(name: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path_prefix: path_prefix.into(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_title: "Notification".to_string(),
            default_icon: Some("/icons/icon-192.png".to_string()),
            default_badge: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file and validate it.
    pub fn load(path: impl AsRef<Path>) -> offkit_common::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            CommonError::config_with_source(format!("failed to parse {}", path.display()), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> offkit_common::Result<()> {
        if self.version.trim().is_empty() {
            return Err(CommonError::config("version must not be empty"));
        }
        let base = self.base_url()?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(CommonError::config(format!(
                "base_url must be http or https, got {}",
                base.scheme()
            )));
        }
        if self.network_timeout_ms == 0 {
            return Err(CommonError::config("network_timeout_ms must be positive"));
        }
        if self.install_attempts == 0 {
            return Err(CommonError::config("install_attempts must be at least 1"));
        }
        if !self.classifier.api_prefix.starts_with('/') {
            return Err(CommonError::config("classifier.api_prefix must start with '/'"));
        }
        for raw in self.precache_manifest.iter().chain([&self.offline_document_url]) {
            base.join(raw).map_err(|e| {
                CommonError::config_with_source(format!("invalid precache URL {raw}"), e)
            })?;
        }

        let mut names = std::collections::HashSet::new();
        for lane in &self.sync.lanes {
            if lane.name.is_empty() || !names.insert(lane.name.as_str()) {
                return Err(CommonError::config(format!(
                    "sync lane names must be unique and non-empty: {:?}",
                    lane.name
                )));
            }
            if !lane.path_prefix.starts_with('/') {
                return Err(CommonError::config(format!(
                    "sync lane {} path_prefix must start with '/'",
                    lane.name
                )));
            }
        }
        if self.sync.backoff_multiplier < 1.0 {
            return Err(CommonError::config("sync.backoff_multiplier must be at least 1.0"));
        }
        if self.sync.max_backoff_secs > MAX_BACKOFF_SECS {
            return Err(CommonError::config(format!(
                "sync.max_backoff_secs must be at most {MAX_BACKOFF_SECS}"
            )));
        }
        if self.sync.initial_backoff_secs > self.sync.max_backoff_secs {
            return Err(CommonError::config(
                "sync.initial_backoff_secs must not exceed sync.max_backoff_secs",
            ));
        }
        Ok(())
    }

    pub fn base_url(&self) -> offkit_common::Result<Url> {
        Url::parse(&self.base_url).map_err(|e| {
            CommonError::config_with_source(format!("invalid base_url {}", self.base_url), e)
        })
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Path of the SQLite database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("offkit.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network_timeout(), Duration::from_secs(10));
        assert!(config.database_path().ends_with("offkit/offkit.db"));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "version": "7",
                "base_url": "https://shop.test/",
                "classifier": { "image_strategy": "cache_first" },
                "partitions": { "api": { "ttl_secs": 60, "max_entries": 10 } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.version, "7");
        assert_eq!(config.classifier.image_strategy, Strategy::CacheFirst);
        assert_eq!(config.classifier.api_prefix, "/api/");

        let policies = config.partitions.policies();
        let api = policies.get(PartitionKey::Api);
        assert_eq!(api.freshness.ttl(), Some(Duration::from_secs(60)));
        assert_eq!(api.max_entries, Some(10));
        assert_eq!(
            policies.get(PartitionKey::Images).freshness.ttl(),
            Some(Duration::from_secs(7 * 24 * 3600))
        );
        assert_eq!(policies.get(PartitionKey::Precache).freshness.ttl(), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig {
            base_url: "ftp://shop.test/".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.base_url = "https://shop.test/".to_string();
        config.sync.lanes.push(LaneConfig::new("cart", "/api/other"));
        assert!(config.validate().is_err());

        config.sync.lanes.pop();
        config.classifier.api_prefix = "api".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_replay_backoff() {
        let mut config = EngineConfig::default();
        config.sync.max_backoff_secs = u64::MAX;
        assert!(config.validate().is_err());

        config.sync.max_backoff_secs = MAX_BACKOFF_SECS;
        config.validate().unwrap();

        config.sync.initial_backoff_secs = MAX_BACKOFF_SECS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lane_for_path() {
        let sync = SyncConfig::default();
        assert_eq!(sync.lane_for("/api/cart/items").unwrap().name, "cart");
        assert_eq!(sync.lane_for("/api/analytics").unwrap().name, "analytics");
        assert!(sync.lane_for("/api/orders").is_none());
        assert_eq!(sync.retry().initial_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offkit.json");
        std::fs::write(&path, r#"{ "version": "2", "network_timeout_ms": 2500 }"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.version, "2");
        assert_eq!(config.network_timeout(), Duration::from_millis(2500));

        std::fs::write(&path, r#"{ "network_timeout_ms": 0 }"#).unwrap();
        assert!(EngineConfig::load(&path).is_err());

        std::fs::write(&path, "not json").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }
}
