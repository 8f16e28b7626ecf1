//! # PWA Common
//!
//! Shared error types, logging setup, and configuration for the offline
//! worker crates.
//!
//! ## Features
//!
//! - Unified error type with backtrace support for internal failures
//! - Logging configuration and subscriber setup
//! - Offline worker configuration (cache name, fallback page, precache list)
//! - Result extension traits

use thiserror::Error;

pub mod config;
pub mod logging;

pub use config::{OfflineConfig, DEFAULT_CACHE_NAME, DEFAULT_OFFLINE_URL};
pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};

/// Unified error type for the offline worker crates.
#[derive(Error, Debug)]
pub enum PwaError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization errors (config files, cache snapshots).
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing errors.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        trace: Option<backtrace::Backtrace>,
    },
}

impl PwaError {
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

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            trace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            PwaError::Config { .. } => "config",
            PwaError::Serialization(_) => "serialization",
            PwaError::Url(_) => "url",
            PwaError::Io(_) => "io",
            PwaError::NotFound(_) => "not_found",
            PwaError::InvalidArgument(_) => "invalid_argument",
            PwaError::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for offline worker operations.
pub type Result<T> = std::result::Result<T, PwaError>;

/// Extension trait for Result.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| PwaError::Internal {
            message: format!("{}: {}", message.into(), e),
            trace: Some(backtrace::Backtrace::new()),
        })
    }
}

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| PwaError::NotFound(resource.into()))
    }
}
