//! Database file placement
//!
//! Every database lives at
//! `<data_root>/ModData/DatabaseManager/<tenant>/<database>.sqlite`, with the
//! engine's `-wal`/`-shm` sidecars and any `.bak_<timestamp>` backups beside it.
//!
//! Tenant and database names are sanitized before they reach the file system:
//! characters that are illegal in a file name become `_`, every `..` becomes
//! `__`, and a lone `.` becomes `_`. A name that had to be changed also gets a
//! short hash suffix of its raw form, so two distinct raw names can never land
//! on the same path. Raw names that already end in something shaped like that
//! suffix are treated as changed too, otherwise one tenant could claim another
//! tenant's sanitized directory by name.

use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use crate::{Error, Result};

/// Directories between the host data root and the tenant directories
pub const ROOT_SEGMENTS: [&str; 2] = ["ModData", "DatabaseManager"];

/// File extension of every main database file
pub const DB_EXTENSION: &str = "sqlite";

pub const WAL_SUFFIX: &str = "-wal";
pub const SHM_SUFFIX: &str = "-shm";
pub const BACKUP_MARKER: &str = ".bak_";

/// Marks a sidecar that was moved aside because its main file was missing
pub const ORPHAN_MARKER: &str = ".orphaned_";

/// Digits in a backup timestamp (`%Y%m%d%H%M%S`)
pub const BACKUP_STAMP_LEN: usize = 14;

const ILLEGAL_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Hex digits of the raw-name hash appended to sanitized names
const DISAMBIGUATION_LEN: usize = 8;

/// Map a raw tenant or database name to a single safe path component.
///
/// Names that need no change are returned as-is. Changed names carry a
/// `-<hash>` suffix computed from the raw input, so an output ending in a
/// suffix-shaped tail always came from this rewrite.
pub fn sanitize_component(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if c.is_ascii_control() || ILLEGAL_CHARS.contains(&c) { '_' } else { c })
        .collect();

    let mut sanitized = replaced.replace("..", "__");
    if sanitized == "." {
        sanitized = "_".to_string();
    }

    if sanitized != raw || has_disambiguation_suffix(raw) {
        let digest = blake3::hash(raw.as_bytes()).to_hex();
        sanitized.push('-');
        sanitized.push_str(&digest.as_str()[..DISAMBIGUATION_LEN]);
    }
    sanitized
}

/// Whether a name ends in `-` plus hex digits of the disambiguation length.
/// Hex case is ignored so names differing only in case on a case-insensitive
/// file system still count.
fn has_disambiguation_suffix(name: &str) -> bool {
    let Some((_, tail)) = name.rsplit_once('-') else {
        return false;
    };
    tail.len() == DISAMBIGUATION_LEN && tail.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Append a suffix to a path without touching its extension
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(path.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

/// Resolved on-disk location of one (tenant, database) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseLocation {
    pub tenant: String,
    pub database: String,
    pub path: PathBuf,
}

impl DatabaseLocation {
    pub fn wal(&self) -> PathBuf {
        with_suffix(&self.path, WAL_SUFFIX)
    }

    pub fn shm(&self) -> PathBuf {
        with_suffix(&self.path, SHM_SUFFIX)
    }

    pub fn sidecars(&self) -> [PathBuf; 2] {
        [self.wal(), self.shm()]
    }

    /// Main backup file for a given timestamp; its sidecars add `-wal`/`-shm`
    pub fn backup_path(&self, stamp: &str) -> PathBuf {
        with_suffix(&self.path, &format!("{BACKUP_MARKER}{stamp}"))
    }

    /// Engine connection descriptor for this database
    pub fn connection_target(&self) -> String {
        format!("Data Source={};", self.path.display())
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

/// One database found on disk
#[derive(Debug, Clone, Serialize)]
pub struct InventoryEntry {
    pub tenant_dir: String,
    pub database_file: String,
    pub size_bytes: u64,
    pub has_wal: bool,
    pub has_shm: bool,
    pub backups: usize,
}

/// Maps (tenant, database) to sanitized paths under the broker root
pub struct PathResolver {
    root: PathBuf,
    dir_lock: Mutex<()>,
}

impl PathResolver {
    /// Create the resolver, eagerly creating `<data_root>/ModData/DatabaseManager`
    pub fn new(data_root: &Path) -> Result<Self> {
        let root = ROOT_SEGMENTS
            .iter()
            .fold(data_root.to_path_buf(), |path, segment| path.join(segment));

        std::fs::create_dir_all(&root).map_err(|e| {
            tracing::error!("Failed to create database root {}: {}", root.display(), e);
            Error::Configuration(format!("cannot create database root {}: {}", root.display(), e))
        })?;

        Ok(Self {
            root,
            dir_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a database path, creating the tenant directory if needed
    pub fn resolve(&self, tenant: &str, database: &str) -> Result<DatabaseLocation> {
        self.locate(tenant, database, false)
    }

    /// Same as [`resolve`](Self::resolve) without the debug trace, for hot paths
    pub fn resolve_quiet(&self, tenant: &str, database: &str) -> Result<DatabaseLocation> {
        self.locate(tenant, database, true)
    }

    fn locate(&self, tenant: &str, database: &str, quiet: bool) -> Result<DatabaseLocation> {
        require_name("tenant", tenant)?;
        require_name("database", database)?;

        let dir = self.root.join(sanitize_component(tenant));
        self.ensure_dir(&dir, tenant)?;

        let path = dir.join(format!("{}.{DB_EXTENSION}", sanitize_component(database)));
        if !quiet {
            tracing::debug!(tenant, database, path = %path.display(), "resolved database path");
        }

        Ok(DatabaseLocation {
            tenant: tenant.to_string(),
            database: database.to_string(),
            path,
        })
    }

    fn ensure_dir(&self, dir: &Path, tenant: &str) -> Result<()> {
        if dir.is_dir() {
            return Ok(());
        }

        let _guard = self.dir_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if dir.is_dir() {
            return Ok(());
        }

        std::fs::create_dir_all(dir).map_err(|e| {
            tracing::error!(tenant, "Failed to create tenant directory {}: {}", dir.display(), e);
            Error::Configuration(format!("cannot create tenant directory {}: {}", dir.display(), e))
        })
    }

    /// Backup main files of a database, oldest first
    pub fn backups(&self, location: &DatabaseLocation) -> Result<Vec<PathBuf>> {
        let Some(dir) = location.path.parent() else {
            return Ok(Vec::new());
        };
        let Some(file_name) = location.path.file_name().and_then(|n| n.to_str()) else {
            return Ok(Vec::new());
        };
        backups_in(dir, file_name)
    }

    /// Every database file currently under the root
    pub fn inventory(&self) -> Result<Vec<InventoryEntry>> {
        let mut entries = Vec::new();

        for tenant_entry in std::fs::read_dir(&self.root)? {
            let tenant_entry = tenant_entry?;
            if !tenant_entry.file_type()?.is_dir() {
                continue;
            }
            let tenant_dir = tenant_entry.path();

            for file in std::fs::read_dir(&tenant_dir)? {
                let file = file?;
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(DB_EXTENSION) {
                    continue;
                }
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };

                entries.push(InventoryEntry {
                    tenant_dir: tenant_entry.file_name().to_string_lossy().to_string(),
                    database_file: file_name.to_string(),
                    size_bytes: file.metadata()?.len(),
                    has_wal: with_suffix(&path, WAL_SUFFIX).exists(),
                    has_shm: with_suffix(&path, SHM_SUFFIX).exists(),
                    backups: backups_in(&tenant_dir, file_name)?.len(),
                });
            }
        }

        entries.sort_by(|a, b| {
            (a.tenant_dir.as_str(), a.database_file.as_str())
                .cmp(&(b.tenant_dir.as_str(), b.database_file.as_str()))
        });
        Ok(entries)
    }
}

fn require_name(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidArgument(format!("{kind} name must not be blank")));
    }
    Ok(())
}

fn backups_in(dir: &Path, file_name: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{file_name}{BACKUP_MARKER}");
    let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(&prefix))
                .is_some_and(is_backup_stamp)
        })
        .collect();
    backups.sort();
    Ok(backups)
}

/// `<14 digits>` or `<14 digits>-<n>`, as written by recovery
fn is_backup_stamp(stamp: &str) -> bool {
    let (time, counter) = match stamp.split_once('-') {
        Some((time, counter)) => (time, Some(counter)),
        None => (stamp, None),
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    time.len() == BACKUP_STAMP_LEN && all_digits(time) && counter.is_none_or(all_digits)
}
