//! Connection broker
//!
//! Hands every tenant live connections to its own databases. The first open
//! of a (tenant, database) pair in a broker's lifetime is validated: a
//! leftover WAL sidecar triggers proactive recovery before anything connects,
//! and a failed quick check triggers reactive recovery. Later opens skip
//! validation. Every connection is forced into WAL mode and tracked until it
//! is closed, by the caller or by [`ConnectionBroker::dispose`].

use dashmap::{DashMap, DashSet};
use rusqlite::{Connection, ErrorCode};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use crate::config::BrokerConfig;
use crate::paths::{DatabaseLocation, PathResolver};
use crate::storage::{
    BrokeredConnection, CheckMode, IntegrityChecker, LiveConnections, PragmaChecker, RecoveryEngine,
    RecoveryOutcome, pragma,
};
use crate::tenant::{TenantAttribution, TenantHandle, TenantRegistry};
use crate::{Error, Result};

/// (tenant, database) as given by the caller
type SessionKey = (String, String);

fn session_key(location: &DatabaseLocation) -> SessionKey {
    (location.tenant.clone(), location.database.clone())
}

pub struct ConnectionBroker {
    config: BrokerConfig,
    paths: PathResolver,
    attribution: TenantAttribution,
    checker: Arc<dyn IntegrityChecker>,
    recovery: RecoveryEngine,
    /// Pairs that passed first-open validation in this broker's lifetime
    validated: DashSet<SessionKey>,
    validation_locks: DashMap<SessionKey, Arc<Mutex<()>>>,
    live: Arc<LiveConnections>,
}

impl ConnectionBroker {
    /// Start a broker with the engine's own integrity checks
    pub fn new(config: BrokerConfig, registry: impl TenantRegistry + 'static) -> Result<Self> {
        Self::with_checker(config, registry, Arc::new(PragmaChecker))
    }

    pub fn with_checker(
        config: BrokerConfig,
        registry: impl TenantRegistry + 'static,
        checker: Arc<dyn IntegrityChecker>,
    ) -> Result<Self> {
        let paths = PathResolver::new(&config.data_root)?;
        let recovery = RecoveryEngine::new(Arc::clone(&checker), config.busy_timeout());
        tracing::info!(root = %paths.root().display(), "Database broker started");

        Ok(Self {
            config,
            paths,
            attribution: TenantAttribution::new(registry),
            checker,
            recovery,
            validated: DashSet::new(),
            validation_locks: DashMap::new(),
            live: LiveConnections::new(),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    /// Issue the handle a tenant module passes to every other operation
    pub fn register(&self, unit: &str) -> Result<TenantHandle> {
        self.attribution.register(unit)
    }

    pub fn resolve_path(&self, handle: &TenantHandle, database: Option<&str>) -> Result<PathBuf> {
        Ok(self.locate(handle, database)?.path)
    }

    pub fn connection_target(&self, handle: &TenantHandle, database: Option<&str>) -> Result<String> {
        Ok(self.locate(handle, database)?.connection_target())
    }

    /// Open a connection to one of the caller's databases
    pub fn open(&self, handle: &TenantHandle, database: Option<&str>) -> Result<BrokeredConnection> {
        let location = self.locate(handle, database)?;
        let conn = self.open_validated(&location).inspect_err(|e| {
            tracing::error!(
                tenant = %location.tenant,
                database = %location.database,
                "Failed to open database: {}",
                e
            );
        })?;
        Ok(self.live.register(conn, &location))
    }

    /// Full integrity check on a private connection; any failure reads as `false`
    pub fn check_integrity(&self, handle: &TenantHandle, database: Option<&str>) -> bool {
        self.check_integrity_with(handle, database, CheckMode::Full)
    }

    pub fn check_integrity_with(&self, handle: &TenantHandle, database: Option<&str>, mode: CheckMode) -> bool {
        let Ok(location) = self.locate(handle, database) else {
            return false;
        };
        if !location.exists() {
            return true;
        }

        match pragma::open_existing(&location.path, self.config.busy_timeout()) {
            Ok(conn) => {
                let ok = self.checker.check(&conn, mode);
                pragma::close_quietly(conn, "integrity check");
                if !ok {
                    tracing::warn!(tenant = %location.tenant, database = %location.database, "{} failed", mode);
                }
                ok
            }
            Err(e) => {
                tracing::warn!(
                    tenant = %location.tenant,
                    database = %location.database,
                    "Could not open database for {}: {}",
                    mode,
                    e
                );
                false
            }
        }
    }

    /// Back up and attempt to repair a database; any failure reads as `false`
    pub fn recover(&self, handle: &TenantHandle, database: Option<&str>) -> bool {
        self.recover_with_outcome(handle, database)
            .map(|outcome| outcome.is_success())
            .unwrap_or(false)
    }

    pub fn recover_with_outcome(&self, handle: &TenantHandle, database: Option<&str>) -> Result<RecoveryOutcome> {
        let location = self.locate(handle, database)?;
        let lock = self.validation_lock(&session_key(&location));
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.recovery.run(&location))
    }

    /// Backups kept for one of the caller's databases
    pub fn backups(&self, handle: &TenantHandle, database: Option<&str>) -> Result<Vec<PathBuf>> {
        let location = self.locate(handle, database)?;
        self.paths.backups(&location)
    }

    /// Whether the pair already passed first-open validation
    pub fn is_validated(&self, handle: &TenantHandle, database: Option<&str>) -> bool {
        let Ok(tenant) = self.attribution.identify(handle) else {
            return false;
        };
        let database = database.unwrap_or(&self.config.default_database);
        self.validated.contains(&(tenant.to_string(), database.to_string()))
    }

    pub fn live_connections(&self) -> usize {
        self.live.len()
    }

    /// Close every connection this broker issued. Safe to call repeatedly.
    pub fn dispose(&self) {
        let closed = self.live.close_all();
        if closed > 0 {
            tracing::info!("Closed {} live connection(s) on shutdown", closed);
        }
    }

    fn locate(&self, handle: &TenantHandle, database: Option<&str>) -> Result<DatabaseLocation> {
        let tenant = self.attribution.identify(handle)?;
        let database = database.unwrap_or(&self.config.default_database);

        let resolved = if self.validated.contains(&(tenant.to_string(), database.to_string())) {
            self.paths.resolve_quiet(tenant, database)
        } else {
            self.paths.resolve(tenant, database)
        };
        resolved.inspect_err(|e| {
            tracing::error!(tenant, database, "Failed to resolve database path: {}", e);
        })
    }

    fn validation_lock(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        Arc::clone(&self.validation_locks.entry(key.clone()).or_default())
    }

    fn open_validated(&self, location: &DatabaseLocation) -> Result<Connection> {
        let key = session_key(location);
        if self.validated.contains(&key) {
            return self.connect(location);
        }

        let lock = self.config.serialize_first_open.then(|| self.validation_lock(&key));
        let _guard = lock.as_ref().map(|l| l.lock().unwrap_or_else(PoisonError::into_inner));
        if self.validated.contains(&key) {
            return self.connect(location);
        }

        let conn = self.validate_first_open(location)?;
        self.validated.insert(key);
        Ok(conn)
    }

    fn validate_first_open(&self, location: &DatabaseLocation) -> Result<Connection> {
        let (tenant, database) = (location.tenant.as_str(), location.database.as_str());

        if location.wal().exists() {
            tracing::warn!(tenant, database, "WAL sidecar found on first open, possible unclean shutdown; recovering");
            if !self.recovery.recover(location) {
                return Err(self.unrecoverable(location));
            }
        }

        match self.connect(location) {
            Ok(conn) if self.checker.check(&conn, CheckMode::Quick) => return Ok(conn),
            Ok(conn) => {
                tracing::warn!(tenant, database, "Quick check failed on first open; recovering");
                pragma::close_quietly(conn, "suspect");
            }
            Err(e) if looks_corrupt(&e) => {
                tracing::warn!(tenant, database, "Database unreadable on first open ({}); recovering", e);
            }
            Err(e) => return Err(e),
        }

        if !self.recovery.recover(location) {
            return Err(self.unrecoverable(location));
        }
        self.connect(location)
    }

    /// Open and force WAL mode; run on every open
    fn connect(&self, location: &DatabaseLocation) -> Result<Connection> {
        let conn = pragma::open_read_write(&location.path, self.config.busy_timeout())?;
        pragma::force_wal(&conn)?;
        Ok(conn)
    }

    fn unrecoverable(&self, location: &DatabaseLocation) -> Error {
        tracing::error!(
            tenant = %location.tenant,
            database = %location.database,
            "Recovery failed; refusing to open database"
        );
        Error::CorruptionUnrecoverable {
            tenant: location.tenant.clone(),
            database: location.database.clone(),
        }
    }
}

impl Drop for ConnectionBroker {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Engine errors that mean "this file is not a sound database"
fn looks_corrupt(error: &Error) -> bool {
    match error {
        Error::Storage(e) => matches!(
            e.sqlite_error_code(),
            Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::StaticRegistry;

    fn broker() -> (tempfile::TempDir, ConnectionBroker, TenantHandle) {
        let dir = tempfile::tempdir().unwrap();
        let registry = StaticRegistry::new().with_tenant("alpha", ["alpha_core"]);
        let broker = ConnectionBroker::new(BrokerConfig::with_data_root(dir.path()), registry).unwrap();
        let handle = broker.register("alpha_core").unwrap();
        (dir, broker, handle)
    }

    #[test]
    fn test_default_database_is_main() {
        let (_dir, broker, handle) = broker();
        let path = broker.resolve_path(&handle, None).unwrap();
        assert_eq!(path.file_name().unwrap(), "main.sqlite");
        assert_eq!(path, broker.resolve_path(&handle, Some("main")).unwrap());
    }

    #[test]
    fn test_open_marks_validated() {
        let (_dir, broker, handle) = broker();
        assert!(!broker.is_validated(&handle, None));
        let _conn = broker.open(&handle, None).unwrap();
        assert!(broker.is_validated(&handle, None));
        assert!(!broker.is_validated(&handle, Some("other")));
    }

    #[test]
    fn test_looks_corrupt() {
        let not_db = Error::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_NOTADB),
            None,
        ));
        let busy = Error::Storage(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(looks_corrupt(&not_db));
        assert!(!looks_corrupt(&busy));
        assert!(!looks_corrupt(&Error::ConnectionClosed));
    }

    #[test]
    fn test_blank_database_rejected() {
        let (_dir, broker, handle) = broker();
        assert!(matches!(broker.open(&handle, Some(" ")), Err(Error::InvalidArgument(_))));
        assert!(!broker.check_integrity(&handle, Some("")));
        assert!(!broker.recover(&handle, Some("")));
    }
}
