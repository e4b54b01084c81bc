//! Error types for the Newsloom collector
//!
//! Every failure a source run can hit maps onto one `AppError` variant.
//! The scheduler uses the classification helpers to decide what gets
//! persisted into `sources.last_error` and what is only logged.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Source configuration (1xxx)
    ConfigInvalid,

    // Upstream (2xxx)
    Transient,
    PermanentUpstream,
    StructureDrift,

    // Store (3xxx)
    StoreError,
    MigrationError,

    // Control flow (4xxx)
    Cancelled,
    Timeout,
    SchedulerOverlap,
    SchedulerError,

    // Internal (9xxx)
    ConfigurationError,
    SerializationError,
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ConfigInvalid => 1001,

            ErrorCode::Transient => 2001,
            ErrorCode::PermanentUpstream => 2002,
            ErrorCode::StructureDrift => 2003,

            ErrorCode::StoreError => 3001,
            ErrorCode::MigrationError => 3002,

            ErrorCode::Cancelled => 4001,
            ErrorCode::Timeout => 4002,
            ErrorCode::SchedulerOverlap => 4003,
            ErrorCode::SchedulerError => 4004,

            ErrorCode::ConfigurationError => 9001,
            ErrorCode::SerializationError => 9002,
            ErrorCode::InternalError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Source configuration
    #[error("invalid source config: {message}")]
    ConfigInvalid { message: String },

    // Upstream failures
    #[error("transient upstream error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("upstream error: {message}")]
    PermanentUpstream {
        status: Option<u16>,
        message: String,
    },

    #[error("html structure drift: {message}")]
    StructureDrift { message: String },

    // Store
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Control flow
    #[error("operation cancelled")]
    Cancelled,

    #[error("source run timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("a collection run is already in progress")]
    SchedulerOverlap,

    #[error("scheduler error: {message}")]
    Scheduler { message: String },

    // Internal
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::ConfigInvalid { .. } => ErrorCode::ConfigInvalid,
            AppError::Transient { .. } => ErrorCode::Transient,
            AppError::PermanentUpstream { .. } => ErrorCode::PermanentUpstream,
            AppError::StructureDrift { .. } => ErrorCode::StructureDrift,
            AppError::Store(_) => ErrorCode::StoreError,
            AppError::Migration(_) => ErrorCode::MigrationError,
            AppError::Cancelled => ErrorCode::Cancelled,
            AppError::Timeout { .. } => ErrorCode::Timeout,
            AppError::SchedulerOverlap => ErrorCode::SchedulerOverlap,
            AppError::Scheduler { .. } => ErrorCode::SchedulerError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Whether the HTTP layer should retry the request that produced this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transient { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }

    /// Provider-requested wait before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        AppError::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn drift(message: impl Into<String>) -> Self {
        AppError::StructureDrift {
            message: message.into(),
        }
    }

    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        AppError::PermanentUpstream {
            status,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        AppError::Transient {
            message: message.into(),
            retry_after,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}
