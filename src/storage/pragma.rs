//! SQL issued by the broker

use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;
use crate::{Error, Result};

/// Fast structural check
pub const QUICK_CHECK: &str = "PRAGMA quick_check";

/// Complete consistency check
pub const INTEGRITY_CHECK: &str = "PRAGMA integrity_check";

/// Repair pass one: rebuild every index
pub const REINDEX: &str = "REINDEX";

/// Repair pass two: rewrite the whole file
pub const VACUUM: &str = "VACUUM";

/// Move every WAL frame into the main file and truncate the log
pub const WAL_CHECKPOINT: &str = "PRAGMA wal_checkpoint(TRUNCATE)";

/// Journal mode every broker connection runs in
pub const JOURNAL_MODE_WAL: &str = "WAL";

/// Open a read-write connection, creating the file if missing
pub fn open_read_write(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// Open an existing file for maintenance without ever creating it
pub fn open_existing(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

/// Switch the connection to write-ahead logging and confirm the engine agreed
pub fn force_wal(conn: &Connection) -> Result<()> {
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", JOURNAL_MODE_WAL, |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case(JOURNAL_MODE_WAL) {
        return Err(Error::Configuration(format!(
            "engine refused WAL journal mode (reported '{mode}')"
        )));
    }
    Ok(())
}

/// Checkpoint the WAL; `false` if the engine could not finish (busy or error)
pub fn drain_wal(conn: &Connection) -> bool {
    match conn.query_row(WAL_CHECKPOINT, [], |row| row.get::<_, i64>(0)) {
        Ok(busy) => busy == 0,
        Err(e) => {
            tracing::warn!("WAL checkpoint failed: {}", e);
            false
        }
    }
}

/// Close a connection, logging instead of failing if the engine objects
pub fn close_quietly(conn: Connection, context: &str) {
    if let Err((_conn, e)) = conn.close() {
        tracing::warn!("Failed to close {} connection cleanly: {}", context, e);
    }
}
