//! SQLite consistency checks.
//!
//! Two severities are offered by the engine:
//!
//! 1. **Quick** (`PRAGMA quick_check`): skips index-content verification.
//!    Used on the first open of a database in a session.
//!
//! 2. **Full** (`PRAGMA integrity_check`): complete scan.
//!    Used after repair passes and by explicit integrity requests.
//!
//! A check passes only when the engine answers with a single `ok`. A check
//! that cannot even run counts as a failure: on a file we expected to be a
//! database, that is itself evidence of corruption.

use rusqlite::Connection;
use super::pragma;

/// Which check to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    Quick,
    Full,
}

impl CheckMode {
    pub fn sql(self) -> &'static str {
        match self {
            Self::Quick => pragma::QUICK_CHECK,
            Self::Full => pragma::INTEGRITY_CHECK,
        }
    }
}

impl std::fmt::Display for CheckMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quick => write!(f, "quick_check"),
            Self::Full => write!(f, "integrity_check"),
        }
    }
}

/// Runs consistency checks against an open connection
pub trait IntegrityChecker: Send + Sync {
    /// `true` when the database is consistent; never fails
    fn check(&self, conn: &Connection, mode: CheckMode) -> bool;
}

/// Checker backed by the engine's built-in pragmas
#[derive(Debug, Clone, Copy, Default)]
pub struct PragmaChecker;

impl IntegrityChecker for PragmaChecker {
    fn check(&self, conn: &Connection, mode: CheckMode) -> bool {
        match conn.query_row(mode.sql(), [], |row| row.get::<_, String>(0)) {
            Ok(result) if passed(&result) => true,
            Ok(result) => {
                tracing::warn!("{} reported problems: {}", mode, result);
                false
            }
            Err(e) => {
                tracing::warn!("{} could not run: {}", mode, e);
                false
            }
        }
    }
}

/// Exact, case-insensitive `ok`; surrounding whitespace is not tolerated
fn passed(result: &str) -> bool {
    result.eq_ignore_ascii_case("ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_passes() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("fresh.sqlite")).unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT); CREATE INDEX t_v ON t(v);")
            .unwrap();

        assert!(PragmaChecker.check(&conn, CheckMode::Quick));
        assert!(PragmaChecker.check(&conn, CheckMode::Full));
    }

    #[test]
    fn test_garbage_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.sqlite");
        std::fs::write(&path, vec![0xA5u8; 8192]).unwrap();

        let conn = Connection::open(&path).unwrap();
        assert!(!PragmaChecker.check(&conn, CheckMode::Quick));
        assert!(!PragmaChecker.check(&conn, CheckMode::Full));
    }

    #[test]
    fn test_mode_sql() {
        assert_eq!(CheckMode::Quick.sql(), "PRAGMA quick_check");
        assert_eq!(CheckMode::Full.to_string(), "integrity_check");
    }

    #[test]
    fn test_only_exact_ok_passes() {
        assert!(passed("ok"));
        assert!(passed("OK"));
        assert!(!passed(" ok"));
        assert!(!passed("ok\n"));
        assert!(!passed("ok ok"));
        assert!(!passed("*** in database main ***"));
    }
}
