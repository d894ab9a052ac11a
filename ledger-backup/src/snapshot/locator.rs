//! Locating and checkpointing the live databases.

use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Side files SQLite keeps next to a database in WAL mode.
pub const SIDE_FILE_SUFFIXES: &[&str] = &["-wal", "-shm"];

pub fn side_file(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Platform seam for where databases live and how they are flushed.
pub trait DatabaseLocator: Send + Sync {
    /// Path reported by the database engine itself, when it can tell.
    fn engine_path(&self, name: &str) -> Option<PathBuf>;

    /// Candidate locations in preference order; the first is the default.
    fn candidates(&self, name: &str) -> Vec<PathBuf>;

    /// Merge the write-ahead log into the main file.
    fn checkpoint(&self, name: &str) -> rusqlite::Result<()>;

    /// Engine path first, then the first existing candidate, then the default.
    fn resolve(&self, name: &str) -> PathBuf {
        if let Some(path) = self.engine_path(name) {
            return path;
        }
        let candidates = self.candidates(name);
        candidates
            .iter()
            .find(|p| p.exists())
            .or_else(|| candidates.first())
            .cloned()
            .unwrap_or_else(|| PathBuf::from(name))
    }
}

/// SQLite files under a data directory, with library-style fallbacks.
///
/// This process holds no live handle of its own, so the engine's view comes
/// from the host app: the paths it registered for its open databases. Each
/// registered path is confirmed through `PRAGMA database_list`, which
/// reports the file SQLite actually opened.
#[derive(Debug, Clone)]
pub struct SqliteLocator {
    data_dir: PathBuf,
    fallback_dirs: Vec<PathBuf>,
    engine_paths: BTreeMap<String, PathBuf>,
}

impl SqliteLocator {
    pub fn new(data_dir: PathBuf, fallback_dirs: Vec<PathBuf>) -> Self {
        Self {
            data_dir,
            fallback_dirs,
            engine_paths: BTreeMap::new(),
        }
    }

    pub fn with_engine_paths(mut self, engine_paths: BTreeMap<String, PathBuf>) -> Self {
        self.engine_paths = engine_paths;
        self
    }

    fn existing_file(&self, name: &str) -> Option<PathBuf> {
        self.engine_path(name)
            .or_else(|| self.candidates(name).into_iter().find(|p| p.is_file()))
    }
}

impl DatabaseLocator for SqliteLocator {
    fn engine_path(&self, name: &str) -> Option<PathBuf> {
        let path = self.engine_paths.get(name).filter(|p| p.is_file())?;
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY).ok()?;
        let mut stmt = conn.prepare("PRAGMA database_list").ok()?;
        let mut rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .ok()?;
        let reported = rows.find_map(|r| match r {
            Ok((schema, file)) if schema == "main" && !file.is_empty() => Some(PathBuf::from(file)),
            _ => None,
        });
        debug!(db = name, reported = ?reported, "Engine-reported database path");
        reported
    }

    fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let mut out = vec![self.data_dir.join(name), self.data_dir.join("SQLite").join(name)];
        out.extend(self.fallback_dirs.iter().map(|d| d.join(name)));
        out
    }

    fn checkpoint(&self, name: &str) -> rusqlite::Result<()> {
        let Some(path) = self.existing_file(name) else {
            return Ok(());
        };
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        // (busy, log frames, checkpointed frames)
        let (busy, log, done): (i64, i64, i64) =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
        debug!(db = name, busy, log, done, "Checkpoint finished");
        Ok(())
    }
}
