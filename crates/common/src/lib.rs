//! Newsloom Common Library
//!
//! Shared code for the collector:
//! - Configuration management
//! - Error types and classification
//! - SQLite store (models, repository, batch transactions)
//! - Metrics

pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{DbPool, Repository, WriteTx};
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
