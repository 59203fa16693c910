//! Backup-then-repair recovery for suspect database files
//!
//! Recovery is best effort. It never runs without first copying the database
//! and its sidecars aside, then tries two repair passes (`REINDEX`, then
//! `VACUUM`), re-checking the file after each. The backup is always left on
//! disk for manual recovery.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use crate::Result;
use crate::paths::{DatabaseLocation, ORPHAN_MARKER, SHM_SUFFIX, WAL_SUFFIX, with_suffix};
use super::integrity::{CheckMode, IntegrityChecker};
use super::pragma;

/// Backup timestamp format, e.g. `20240131235959`
pub const BACKUP_STAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Structural repair attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairPass {
    /// Rebuild every index
    Reindex,
    /// Rewrite the whole file
    Vacuum,
}

impl RepairPass {
    pub const ALL: [RepairPass; 2] = [RepairPass::Reindex, RepairPass::Vacuum];

    pub fn sql(self) -> &'static str {
        match self {
            Self::Reindex => pragma::REINDEX,
            Self::Vacuum => pragma::VACUUM,
        }
    }
}

impl std::fmt::Display for RepairPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.sql())
    }
}

/// What a recovery attempt did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// No database file exists yet; stray sidecars were moved aside
    NothingToRecover,
    /// A repair pass left the file passing a full check
    Repaired { pass: RepairPass, backup: PathBuf },
    /// The safety copy (or setting aside orphaned sidecars) failed; nothing
    /// was repaired
    BackupFailed,
    /// Both passes failed; the file is left as-is
    Unrepairable { backup: PathBuf },
}

impl RecoveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::NothingToRecover | Self::Repaired { .. })
    }

    pub fn backup(&self) -> Option<&Path> {
        match self {
            Self::Repaired { backup, .. } | Self::Unrepairable { backup } => Some(backup),
            Self::NothingToRecover | Self::BackupFailed => None,
        }
    }
}

/// Backs up and repairs database files
pub struct RecoveryEngine {
    checker: Arc<dyn IntegrityChecker>,
    busy_timeout: Duration,
}

impl RecoveryEngine {
    pub fn new(checker: Arc<dyn IntegrityChecker>, busy_timeout: Duration) -> Self {
        Self { checker, busy_timeout }
    }

    /// Run recovery and report only whether the database is usable afterwards
    pub fn recover(&self, location: &DatabaseLocation) -> bool {
        self.run(location).is_success()
    }

    pub fn run(&self, location: &DatabaseLocation) -> RecoveryOutcome {
        let (tenant, database) = (location.tenant.as_str(), location.database.as_str());

        if !location.exists() {
            tracing::debug!(tenant, database, "No database file, nothing to recover");
            if let Err(e) = set_aside_orphaned_sidecars(location) {
                tracing::error!(tenant, database, "Could not move orphaned sidecars aside: {}", e);
                return RecoveryOutcome::BackupFailed;
            }
            return RecoveryOutcome::NothingToRecover;
        }

        let backup = match self.backup(location) {
            Ok(backup) => backup,
            Err(e) => {
                tracing::error!(tenant, database, "Backup before recovery failed, aborting: {}", e);
                return RecoveryOutcome::BackupFailed;
            }
        };
        tracing::info!(tenant, database, backup = %backup.display(), "Backed up database before repair");

        for pass in RepairPass::ALL {
            match self.repair(location, pass) {
                Ok(Some(drained)) => {
                    if drained {
                        remove_sidecars(location);
                    } else {
                        tracing::warn!(tenant, database, "WAL still in use, keeping sidecar files");
                    }
                    tracing::info!(tenant, database, "Database repaired by {}", pass);
                    return RecoveryOutcome::Repaired { pass, backup };
                }
                Ok(None) => {
                    tracing::warn!(tenant, database, "{} completed but the database is still inconsistent", pass);
                }
                Err(e) => {
                    tracing::warn!(tenant, database, "{} failed: {}", pass, e);
                }
            }
        }

        tracing::error!(
            tenant,
            database,
            backup = %backup.display(),
            "Database could not be repaired; backup kept for manual recovery"
        );
        RecoveryOutcome::Unrepairable { backup }
    }

    /// Copy the main file and any sidecars to a fresh timestamped backup.
    /// A partial copy is removed so it is never mistaken for a backup.
    fn backup(&self, location: &DatabaseLocation) -> Result<PathBuf> {
        let backup = allocate_backup(location, &stamp());
        match copy_with_sidecars(location, &backup) {
            Ok(()) => Ok(backup),
            Err(e) => {
                discard_backup(&backup);
                Err(e)
            }
        }
    }

    /// Apply one pass and re-check. `Some(drained)` when the file is now
    /// consistent, where `drained` says whether the WAL was fully checkpointed.
    fn repair(&self, location: &DatabaseLocation, pass: RepairPass) -> Result<Option<bool>> {
        let conn = pragma::open_existing(&location.path, self.busy_timeout)?;
        let applied = conn.execute_batch(pass.sql());
        pragma::close_quietly(conn, "repair");
        applied?;

        let conn = pragma::open_existing(&location.path, self.busy_timeout)?;
        let healthy = self.checker.check(&conn, CheckMode::Full);
        let drained = healthy && pragma::drain_wal(&conn);
        pragma::close_quietly(conn, "verification");
        Ok(healthy.then_some(drained))
    }
}

fn stamp() -> String {
    chrono::Local::now().format(BACKUP_STAMP_FORMAT).to_string()
}

fn copy_with_sidecars(location: &DatabaseLocation, backup: &Path) -> Result<()> {
    std::fs::copy(&location.path, backup)?;
    for (sidecar, suffix) in [(location.wal(), WAL_SUFFIX), (location.shm(), SHM_SUFFIX)] {
        if sidecar.exists() {
            std::fs::copy(&sidecar, with_suffix(backup, suffix))?;
        }
    }
    Ok(())
}

fn discard_backup(backup: &Path) {
    for part in [backup.to_path_buf(), with_suffix(backup, WAL_SUFFIX), with_suffix(backup, SHM_SUFFIX)] {
        match std::fs::remove_file(&part) {
            Ok(()) => tracing::debug!("Removed partial backup {}", part.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove partial backup {}: {}", part.display(), e),
        }
    }
}

/// Sidecars with no main file would be replayed into a newly created
/// database, so they are renamed to `<sidecar>.orphaned_<stamp>`.
fn set_aside_orphaned_sidecars(location: &DatabaseLocation) -> Result<()> {
    let stamp = stamp();
    for sidecar in location.sidecars() {
        if !sidecar.exists() {
            continue;
        }
        let target = with_suffix(&sidecar, &format!("{ORPHAN_MARKER}{stamp}"));
        std::fs::rename(&sidecar, &target)?;
        tracing::warn!(
            tenant = %location.tenant,
            database = %location.database,
            "Orphaned sidecar without a database file moved to {}",
            target.display()
        );
    }
    Ok(())
}

fn allocate_backup(location: &DatabaseLocation, stamp: &str) -> PathBuf {
    let base = location.backup_path(stamp);
    if !base.exists() {
        return base;
    }
    (1u32..)
        .map(|n| with_suffix(&base, &format!("-{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(base)
}

fn remove_sidecars(location: &DatabaseLocation) {
    for sidecar in location.sidecars() {
        match std::fs::remove_file(&sidecar) {
            Ok(()) => tracing::debug!("Removed sidecar {}", sidecar.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove sidecar {}: {}", sidecar.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::PathResolver;
    use crate::storage::integrity::PragmaChecker;
    use rusqlite::Connection;

    fn setup() -> (tempfile::TempDir, PathResolver, RecoveryEngine) {
        let dir = tempfile::tempdir().unwrap();
        let resolver = PathResolver::new(dir.path()).unwrap();
        let engine = RecoveryEngine::new(Arc::new(PragmaChecker), Duration::from_millis(500));
        (dir, resolver, engine)
    }

    fn populate(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL);
             CREATE INDEX notes_body ON notes(body);",
        )
        .unwrap();
        for i in 0..500 {
            conn.execute(
                "INSERT INTO notes (body) VALUES (?1)",
                [format!("note number {i} {}", "x".repeat(64))],
            )
            .unwrap();
        }
    }

    /// Unlink an index from the schema without freeing its pages
    fn orphan_index_pages(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "PRAGMA writable_schema = ON;
             DELETE FROM sqlite_master WHERE name = 'notes_body';
             PRAGMA writable_schema = OFF;",
        )
        .unwrap();
    }

    fn full_check(path: &Path) -> bool {
        let conn = Connection::open(path).unwrap();
        PragmaChecker.check(&conn, CheckMode::Full)
    }

    #[test]
    fn test_missing_file_needs_no_recovery() {
        let (_dir, resolver, engine) = setup();
        let location = resolver.resolve("tenant", "main").unwrap();

        assert_eq!(engine.run(&location), RecoveryOutcome::NothingToRecover);
        assert!(engine.recover(&location));
        assert!(resolver.backups(&location).unwrap().is_empty());
        assert!(!location.exists());
    }

    #[test]
    fn test_healthy_database_recovers_trivially() {
        let (_dir, resolver, engine) = setup();
        let location = resolver.resolve("tenant", "main").unwrap();
        populate(&location.path);
        std::fs::write(location.wal(), b"").unwrap();

        let outcome = engine.run(&location);
        assert!(matches!(outcome, RecoveryOutcome::Repaired { pass: RepairPass::Reindex, .. }));

        let backup = outcome.backup().unwrap().to_path_buf();
        assert!(backup.exists());
        assert!(with_suffix(&backup, WAL_SUFFIX).exists());
        assert!(!location.wal().exists());
        assert!(!location.shm().exists());
    }

    #[test]
    fn test_garbage_is_unrepairable_but_backed_up() {
        let (_dir, resolver, engine) = setup();
        let location = resolver.resolve("tenant", "main").unwrap();
        let garbage = vec![0x5Au8; 16 * 1024];
        std::fs::write(&location.path, &garbage).unwrap();

        let outcome = engine.run(&location);
        assert!(matches!(outcome, RecoveryOutcome::Unrepairable { .. }));
        assert!(!outcome.is_success());

        let backups = resolver.backups(&location).unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(std::fs::read(&backups[0]).unwrap(), garbage);
        assert_eq!(std::fs::read(&location.path).unwrap(), garbage);
    }

    #[test]
    fn test_orphaned_pages_repaired_by_vacuum() {
        let (_dir, resolver, engine) = setup();
        let location = resolver.resolve("tenant", "main").unwrap();
        populate(&location.path);
        orphan_index_pages(&location.path);
        assert!(!full_check(&location.path));

        let outcome = engine.run(&location);
        assert!(matches!(outcome, RecoveryOutcome::Repaired { pass: RepairPass::Vacuum, .. }));
        assert!(full_check(&location.path));
        assert_eq!(resolver.backups(&location).unwrap().len(), 1);

        let conn = Connection::open(&location.path).unwrap();
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0)).unwrap();
        assert_eq!(rows, 500);
    }

    #[test]
    fn test_failed_backup_aborts_and_leaves_no_copy() {
        let (_dir, resolver, engine) = setup();
        let location = resolver.resolve("tenant", "main").unwrap();
        populate(&location.path);
        let before = std::fs::read(&location.path).unwrap();
        // A directory where the WAL sidecar should be cannot be copied
        std::fs::create_dir(location.wal()).unwrap();

        assert_eq!(engine.run(&location), RecoveryOutcome::BackupFailed);
        assert!(!engine.recover(&location));
        assert!(resolver.backups(&location).unwrap().is_empty());
        assert_eq!(std::fs::read(&location.path).unwrap(), before);

        let leftovers: Vec<_> = std::fs::read_dir(location.path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".bak_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_orphaned_wal_is_set_aside() {
        let (_dir, resolver, engine) = setup();
        let location = resolver.resolve("tenant", "main").unwrap();
        std::fs::write(location.wal(), b"stale frames").unwrap();

        assert_eq!(engine.run(&location), RecoveryOutcome::NothingToRecover);
        assert!(!location.wal().exists());
        assert!(!location.exists());
        assert!(resolver.backups(&location).unwrap().is_empty());

        let moved: Vec<_> = std::fs::read_dir(location.path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("main.sqlite-wal.orphaned_"))
            .collect();
        assert_eq!(moved.len(), 1);
        assert_eq!(std::fs::read(moved[0].path()).unwrap(), b"stale frames");
    }

    #[test]
    fn test_repeated_recovery_keeps_every_backup() {
        let (_dir, resolver, engine) = setup();
        let location = resolver.resolve("tenant", "main").unwrap();
        populate(&location.path);

        assert!(engine.recover(&location));
        assert!(engine.recover(&location));
        assert_eq!(resolver.backups(&location).unwrap().len(), 2);
    }
}
