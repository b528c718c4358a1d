//! Error taxonomy for the offline engine.

use offkit_common::CommonError;
use offkit_net::NetError;
use thiserror::Error;
use uuid::Uuid;

use crate::strategy::StrategyError;

/// Errors raised by cache and queue backends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Quota exceeded writing to {partition}: {needed} bytes needed, {limit} allowed")]
    QuotaExceeded {
        partition: String,
        needed: usize,
        limit: usize,
    },

    #[error("Unknown partition: {0}")]
    UnknownPartition(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Errors surfaced by the engine.
///
/// Most of these never reach a request caller: strategy fallback chains
/// absorb them. Only bypassed or network-only requests propagate
/// [`EngineError::Network`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("No cached entry for {0}")]
    CacheMiss(String),

    #[error("Store write failed: {0}")]
    StoreWriteFailure(#[from] StoreError),

    #[error("Install of version {version} failed; {} manifest URL(s) could not be fetched", failed.len())]
    InstallManifestFailure { version: String, failed: Vec<String> },

    #[error("Replay of queued operation {id} failed: {reason}")]
    QueueReplayFailure { id: Uuid, reason: String },

    #[error("No active version")]
    NoActiveVersion,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error(transparent)]
    Network(#[from] NetError),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl EngineError {
    /// Lost connectivity becomes [`EngineError::NetworkUnavailable`]; any
    /// other transport failure keeps its source.
    pub fn from_transport(error: NetError) -> Self {
        if error.is_connectivity() {
            EngineError::NetworkUnavailable(error.to_string())
        } else {
            EngineError::Network(error)
        }
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::NetworkUnavailable(_) => "network_unavailable",
            EngineError::CacheMiss(_) => "cache_miss",
            EngineError::StoreWriteFailure(_) => "store_write",
            EngineError::InstallManifestFailure { .. } => "install_manifest",
            EngineError::QueueReplayFailure { .. } => "queue_replay",
            EngineError::NoActiveVersion => "no_active_version",
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::StateError(_) => "state",
            EngineError::Network(_) => "network",
            EngineError::Common(e) => e.category(),
        }
    }
}

impl From<StrategyError> for EngineError {
    fn from(error: StrategyError) -> Self {
        match error {
            StrategyError::Unavailable { url } => EngineError::CacheMiss(url),
            StrategyError::Network(e) => EngineError::from_transport(e),
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_failure_message_counts_urls() {
        let err = EngineError::InstallManifestFailure {
            version: "7".to_string(),
            failed: vec!["https://shop.test/a".into(), "https://shop.test/b".into()],
        };
        assert_eq!(
            err.to_string(),
            "Install of version 7 failed; 2 manifest URL(s) could not be fetched"
        );
        assert_eq!(err.category(), "install_manifest");
    }

    #[test]
    fn test_transport_failures_split_on_connectivity() {
        let offline = EngineError::from_transport(NetError::Offline);
        assert!(matches!(offline, EngineError::NetworkUnavailable(_)));
        assert_eq!(offline.category(), "network_unavailable");

        let invalid = EngineError::from_transport(NetError::InvalidUrl("nope".into()));
        assert!(matches!(invalid, EngineError::Network(NetError::InvalidUrl(_))));
    }

    #[test]
    fn test_strategy_errors_convert() {
        let miss: EngineError = StrategyError::Unavailable { url: "https://shop.test/a".into() }.into();
        assert!(matches!(miss, EngineError::CacheMiss(ref url) if url == "https://shop.test/a"));
        assert_eq!(miss.category(), "cache_miss");

        let down: EngineError = StrategyError::Network(NetError::Offline).into();
        assert!(matches!(down, EngineError::NetworkUnavailable(_)));
    }

    #[test]
    fn test_store_error_converts() {
        let err: EngineError = StoreError::UnknownPartition("api-v1".into()).into();
        assert_eq!(err.category(), "store_write");
    }
}
