//! Broker-issued connections and the live connection set
//!
//! A [`BrokeredConnection`] shares its connection slot with the broker's
//! [`LiveConnections`], so the broker can close a connection the caller still
//! holds. Closing from either side empties the slot and removes the entry;
//! later use of the handle fails with [`Error::ConnectionClosed`].

use dashmap::DashMap;
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use crate::paths::DatabaseLocation;
use crate::{Error, Result};
use super::pragma;

type Slot = Arc<Mutex<Option<Connection>>>;

fn lock(slot: &Slot) -> MutexGuard<'_, Option<Connection>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LiveEntry {
    slot: Slot,
    tenant: String,
    database: String,
}

/// Every connection issued by one broker and not yet closed
#[derive(Default)]
pub struct LiveConnections {
    next_id: AtomicU64,
    entries: DashMap<u64, LiveEntry>,
}

impl LiveConnections {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track `conn` and hand it out wrapped
    pub fn register(self: &Arc<Self>, conn: Connection, location: &DatabaseLocation) -> BrokeredConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot: Slot = Arc::new(Mutex::new(Some(conn)));

        self.entries.insert(
            id,
            LiveEntry {
                slot: Arc::clone(&slot),
                tenant: location.tenant.clone(),
                database: location.database.clone(),
            },
        );
        tracing::debug!(tenant = %location.tenant, database = %location.database, id, "Connection issued");

        BrokeredConnection {
            id,
            location: location.clone(),
            slot,
            live: Arc::downgrade(self),
        }
    }

    fn deregister(&self, id: u64) {
        self.entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close every tracked connection and clear the set; returns how many were closed
    pub fn close_all(&self) -> usize {
        // Snapshot first so no map shard is locked while a slot is
        let snapshot: Vec<(u64, Slot, String, String)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), Arc::clone(&e.slot), e.tenant.clone(), e.database.clone()))
            .collect();

        let mut closed = 0;
        for (id, slot, tenant, database) in snapshot {
            let taken = lock(&slot).take();
            if let Some(conn) = taken {
                if let Err((_conn, e)) = conn.close() {
                    tracing::warn!(tenant = %tenant, database = %database, "Failed to close connection on shutdown: {}", e);
                }
                closed += 1;
            }
            self.deregister(id);
        }
        closed
    }
}

/// Connection handed to a tenant by the broker
pub struct BrokeredConnection {
    id: u64,
    location: DatabaseLocation,
    slot: Slot,
    live: Weak<LiveConnections>,
}

impl BrokeredConnection {
    pub fn tenant(&self) -> &str {
        &self.location.tenant
    }

    pub fn database(&self) -> &str {
        &self.location.database
    }

    pub fn path(&self) -> &Path {
        &self.location.path
    }

    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.slot).is_none()
    }

    /// Run `f` against the underlying connection
    pub fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = lock(&self.slot);
        let conn = guard.as_ref().ok_or(Error::ConnectionClosed)?;
        Ok(f(conn)?)
    }

    /// Run `f` with mutable access, e.g. to start a transaction
    pub fn with_mut<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut guard = lock(&self.slot);
        let conn = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        Ok(f(conn)?)
    }

    /// Close now, surfacing any engine error. Closing twice is a no-op.
    pub fn close(self) -> Result<()> {
        let taken = lock(&self.slot).take();
        self.release();
        match taken {
            Some(conn) => conn.close().map_err(|(_conn, e)| Error::Storage(e)),
            None => Ok(()),
        }
    }

    fn release(&self) {
        if let Some(live) = self.live.upgrade() {
            live.deregister(self.id);
        }
    }
}

impl std::fmt::Debug for BrokeredConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokeredConnection")
            .field("id", &self.id)
            .field("tenant", &self.location.tenant)
            .field("database", &self.location.database)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for BrokeredConnection {
    fn drop(&mut self) {
        let taken = lock(&self.slot).take();
        if let Some(conn) = taken {
            pragma::close_quietly(conn, "dropped");
        }
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(dir: &Path) -> DatabaseLocation {
        DatabaseLocation {
            tenant: "tenant".to_string(),
            database: "main".to_string(),
            path: dir.join("main.sqlite"),
        }
    }

    fn open(location: &DatabaseLocation) -> Connection {
        Connection::open(&location.path).unwrap()
    }

    #[test]
    fn test_register_and_use() {
        let dir = tempfile::tempdir().unwrap();
        let location = location(dir.path());
        let live = LiveConnections::new();

        let conn = live.register(open(&location), &location);
        assert_eq!(live.len(), 1);
        assert_eq!(conn.tenant(), "tenant");

        let one: i64 = conn.with(|c| c.query_row("SELECT 1", [], |row| row.get(0))).unwrap();
        assert_eq!(one, 1);

        conn.with_mut(|c| {
            let tx = c.transaction()?;
            tx.execute_batch("CREATE TABLE t (v INTEGER)")?;
            tx.commit()
        })
        .unwrap();
    }

    #[test]
    fn test_caller_close_deregisters() {
        let dir = tempfile::tempdir().unwrap();
        let location = location(dir.path());
        let live = LiveConnections::new();

        let conn = live.register(open(&location), &location);
        conn.close().unwrap();
        assert!(live.is_empty());
    }

    #[test]
    fn test_drop_deregisters() {
        let dir = tempfile::tempdir().unwrap();
        let location = location(dir.path());
        let live = LiveConnections::new();

        {
            let _conn = live.register(open(&location), &location);
            assert_eq!(live.len(), 1);
        }
        assert!(live.is_empty());
    }

    #[test]
    fn test_close_all_invalidates_handles() {
        let dir = tempfile::tempdir().unwrap();
        let location = location(dir.path());
        let live = LiveConnections::new();

        let first = live.register(open(&location), &location);
        let second = live.register(open(&location), &location);
        let dropped = live.register(open(&location), &location);
        drop(dropped);

        assert_eq!(live.close_all(), 2);
        assert!(live.is_empty());
        assert!(first.is_closed());
        assert!(matches!(first.with(|c| c.execute_batch("SELECT 1")), Err(Error::ConnectionClosed)));
        assert!(matches!(second.with_mut(|c| c.execute_batch("SELECT 1")), Err(Error::ConnectionClosed)));

        assert_eq!(live.close_all(), 0);
        first.close().unwrap();
    }
}
