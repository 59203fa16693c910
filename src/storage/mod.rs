//! Storage Layer - SQLite connections, integrity and recovery
//!
//! - pragma: SQL the broker issues against tenant databases
//! - integrity: quick/full consistency checks
//! - recovery: backup-then-repair of suspect database files
//! - connection: broker-issued handles and the live connection set

pub mod connection;
pub mod integrity;
pub mod pragma;
pub mod recovery;

pub use connection::{BrokeredConnection, LiveConnections};
pub use integrity::{CheckMode, IntegrityChecker, PragmaChecker};
pub use recovery::{RecoveryEngine, RecoveryOutcome, RepairPass};
