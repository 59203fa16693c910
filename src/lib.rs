//! # tenantdb - Embedded multi-tenant SQLite broker
//!
//! Hands out per-tenant SQLite connections inside a single host process.
//!
//! tenantdb provides:
//! - Sanitized, collision-free on-disk placement per (tenant, database)
//! - Capability-token tenant attribution backed by the host's registry
//! - WAL-mode enforcement on every connection
//! - One-time-per-session integrity verification
//! - Backup-then-repair recovery for suspected corruption

pub mod broker;
pub mod config;
pub mod paths;
pub mod storage;
pub mod tenant;
pub mod ui;

// Re-exports for convenient access
pub use broker::ConnectionBroker;
pub use config::BrokerConfig;
pub use paths::{DatabaseLocation, PathResolver};
pub use storage::{BrokeredConnection, CheckMode, IntegrityChecker, RecoveryEngine, RecoveryOutcome};
pub use tenant::{StaticRegistry, TenantHandle, TenantRegistry};

/// Name used when a caller does not specify a database
pub const DEFAULT_DATABASE: &str = "main";

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for broker operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Database '{database}' of tenant '{tenant}' is corrupt and could not be recovered")]
    CorruptionUnrecoverable { tenant: String, database: String },

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}
