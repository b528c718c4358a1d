//! # Offkit Common
//!
//! Shared utilities for the Offkit offline engine crates.
//!
//! ## Features
//!
//! - Common error type for configuration, I/O and timeouts
//! - Logging configuration and setup
//! - Retry, backoff and timeout utilities
//! - Wall-clock abstraction with a controllable test clock

use std::time::Duration;
use thiserror::Error;

pub mod clock;
pub mod logging;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Errors shared by the Offkit crates.
#[derive(Error, Debug)]
pub enum CommonError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl CommonError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommonError::Timeout(_) | CommonError::Io(_))
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            CommonError::Config { .. } => "config",
            CommonError::Io(_) => "io",
            CommonError::Json(_) => "json",
            CommonError::Timeout(_) => "timeout",
        }
    }
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(CommonError::config("bad").category(), "config");
        assert_eq!(
            CommonError::Timeout(Duration::from_secs(1)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(CommonError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!CommonError::config("bad").is_retryable());
    }

    #[test]
    fn test_config_with_source_keeps_message() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = CommonError::config_with_source("loading engine.json", io);
        assert_eq!(err.to_string(), "Config error: loading engine.json");
        assert!(std::error::Error::source(&err).is_some());
    }
}
