//! Snapshot builder.
//!
//! Copies each live database (plus its WAL/SHM side files) into a staging
//! directory after forcing a checkpoint, and serializes the key-value store
//! minus the deny-list. The staging tree is laid out exactly as the archive:
//!
//! ```text
//! <staging_root>/data/manifest.json
//! <staging_root>/data/asyncStorage.json
//! <staging_root>/data/<db>[-wal|-shm]
//! ```

pub mod locator;
pub mod manifest;

use crate::kv::{self, KeyValueStore};
use crate::utils::errors::Result;
use locator::{side_file, DatabaseLocator, SIDE_FILE_SUFFIXES};
use manifest::Manifest;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DATA_DIR_NAME: &str = "data";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const KV_SNAPSHOT_FILE: &str = "asyncStorage.json";

/// Result of a snapshot run
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Root of the staging tree (the directory that gets zipped)
    pub staging_root: PathBuf,
    /// `<staging_root>/data`
    pub data_dir: PathBuf,
    pub manifest: Manifest,
}

/// Build a fresh snapshot under `staging_root`, replacing anything already there.
///
/// Missing databases or side files are skipped. A failed checkpoint is logged
/// and the main file is copied as it currently is.
pub fn build_snapshot(
    staging_root: &Path,
    owner_id: &str,
    databases: &[String],
    locator: &dyn DatabaseLocator,
    store: &dyn KeyValueStore,
) -> Result<Snapshot> {
    if staging_root.exists() {
        std::fs::remove_dir_all(staging_root)?;
    }
    let data_dir = staging_root.join(DATA_DIR_NAME);
    std::fs::create_dir_all(&data_dir)?;

    let mut manifest = Manifest::new(owner_id);

    for name in databases {
        if let Err(e) = locator.checkpoint(name) {
            warn!(db = %name, error = %e, "Checkpoint failed, copying main file as-is");
        }

        let source = locator.resolve(name);
        if !source.is_file() {
            info!(db = %name, path = %source.display(), "Database not present, skipping");
            continue;
        }

        std::fs::copy(&source, data_dir.join(name))?;
        manifest.db_files.push(name.clone());

        for suffix in SIDE_FILE_SUFFIXES {
            let side = side_file(&source, suffix);
            if side.is_file() {
                let side_name = format!("{name}{suffix}");
                std::fs::copy(&side, data_dir.join(&side_name))?;
                manifest.db_files.push(side_name);
            }
        }
    }

    let entries = kv::exportable_entries(store)?;
    std::fs::write(
        data_dir.join(KV_SNAPSHOT_FILE),
        serde_json::to_vec_pretty(&entries)?,
    )?;

    std::fs::write(
        data_dir.join(MANIFEST_FILE),
        serde_json::to_vec_pretty(&manifest)?,
    )?;

    info!(
        "Snapshot built: {} database files, {} preference keys",
        manifest.db_files.len(),
        entries.len()
    );

    Ok(Snapshot {
        staging_root: staging_root.to_path_buf(),
        data_dir,
        manifest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::SqliteKvStore;
    use locator::SqliteLocator;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct FailingCheckpoint(SqliteLocator);

    impl DatabaseLocator for FailingCheckpoint {
        fn engine_path(&self, name: &str) -> Option<PathBuf> {
            self.0.engine_path(name)
        }

        fn candidates(&self, name: &str) -> Vec<PathBuf> {
            self.0.candidates(name)
        }

        fn checkpoint(&self, _name: &str) -> rusqlite::Result<()> {
            Err(rusqlite::Error::InvalidQuery)
        }
    }

    fn dbs() -> Vec<String> {
        vec!["accountsDB.db".to_string(), "ledgerDB.db".to_string()]
    }

    #[test]
    fn test_missing_databases_are_skipped() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("accountsDB.db"), b"not really sqlite").unwrap();
        std::fs::write(live.join("accountsDB.db-shm"), b"shm").unwrap();

        let store = SqliteKvStore::open(&dir.path().join("prefs.db")).unwrap();
        let locator = SqliteLocator::new(live, vec![]);

        let snapshot =
            build_snapshot(&dir.path().join("staging"), "owner", &dbs(), &locator, &store).unwrap();

        assert_eq!(
            snapshot.manifest.db_files,
            vec!["accountsDB.db".to_string(), "accountsDB.db-shm".to_string()]
        );
        assert!(snapshot.data_dir.join("accountsDB.db").is_file());
        assert!(snapshot.data_dir.join("accountsDB.db-shm").is_file());
        assert!(!snapshot.data_dir.join("accountsDB.db-wal").exists());
        assert!(!snapshot.data_dir.join("ledgerDB.db").exists());
    }

    #[test]
    fn test_manifest_lists_exactly_copied_files() {
        let dir = TempDir::new().unwrap();
        let store = SqliteKvStore::open(&dir.path().join("prefs.db")).unwrap();
        let locator = SqliteLocator::new(dir.path().join("empty"), vec![]);

        let snapshot =
            build_snapshot(&dir.path().join("staging"), "owner", &dbs(), &locator, &store).unwrap();
        assert!(snapshot.manifest.db_files.is_empty());

        let on_disk: Vec<String> = std::fs::read_dir(&snapshot.data_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n != MANIFEST_FILE && n != KV_SNAPSHOT_FILE)
            .collect();
        assert!(on_disk.is_empty());
    }

    #[test]
    fn test_checkpoint_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("ledgerDB.db"), b"contents").unwrap();

        let store = SqliteKvStore::open(&dir.path().join("prefs.db")).unwrap();
        let locator = FailingCheckpoint(SqliteLocator::new(live, vec![]));

        let snapshot =
            build_snapshot(&dir.path().join("staging"), "owner", &dbs(), &locator, &store).unwrap();
        assert_eq!(snapshot.manifest.db_files, vec!["ledgerDB.db".to_string()]);
        assert_eq!(
            std::fs::read(snapshot.data_dir.join("ledgerDB.db")).unwrap(),
            b"contents"
        );
    }

    #[test]
    fn test_kv_snapshot_excludes_denied_keys() {
        let dir = TempDir::new().unwrap();
        let store = SqliteKvStore::open(&dir.path().join("prefs.db")).unwrap();
        store.set("authToken", "T1").unwrap();
        store.set("backup.remoteFileId", "abc").unwrap();
        store.set("theme", "dark").unwrap();
        let locator = SqliteLocator::new(dir.path().join("empty"), vec![]);

        let snapshot =
            build_snapshot(&dir.path().join("staging"), "owner", &dbs(), &locator, &store).unwrap();

        let raw = std::fs::read(snapshot.data_dir.join(KV_SNAPSHOT_FILE)).unwrap();
        let entries: BTreeMap<String, String> = serde_json::from_slice(&raw).unwrap();
        let mut expected = BTreeMap::new();
        expected.insert("theme".to_string(), "dark".to_string());
        assert_eq!(entries, expected);
    }

    #[test]
    fn test_stale_staging_is_replaced() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir_all(staging.join("data")).unwrap();
        std::fs::write(staging.join("data").join("ledgerDB.db"), b"stale").unwrap();

        let store = SqliteKvStore::open(&dir.path().join("prefs.db")).unwrap();
        let locator = SqliteLocator::new(dir.path().join("empty"), vec![]);
        let snapshot = build_snapshot(&staging, "owner", &dbs(), &locator, &store).unwrap();

        assert!(!snapshot.data_dir.join("ledgerDB.db").exists());
        let written: Manifest =
            serde_json::from_slice(&std::fs::read(snapshot.data_dir.join(MANIFEST_FILE)).unwrap())
                .unwrap();
        assert_eq!(written.owner_id, "owner");
    }
}
