//! Restore orchestration: download, unpack, overwrite live files, replay
//! preferences.
//!
//! Nothing live is touched until the archive has been downloaded and
//! unpacked. After that, a failure part-way through the copy loop leaves the
//! files copied so far in place.

use super::{clear_scratch, BackupService, Phase};
use crate::archive;
use crate::events::BackupEvent;
use crate::kv::{self, KeyValueStore, REMOTE_FILE_ID_KEY, RESTORE_PENDING_KEY};
use crate::remote::RemoteFile;
use crate::snapshot::locator::{side_file, DatabaseLocator, SIDE_FILE_SUFFIXES};
use crate::snapshot::KV_SNAPSHOT_FILE;
use crate::utils::errors::Result;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub(super) const RESTORE_SCRATCH: &str = "restore";
const DOWNLOAD_FILE: &str = "download.zip";
const UNPACK_DIR: &str = "unpacked";

/// What a restore changed. The caller must restart the process afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub file_id: String,
    /// Files written over their live counterparts
    pub restored_files: Vec<String>,
    /// Live side files deleted because the archive had none
    pub removed_files: Vec<String>,
    /// `None` when the archive carried no preference snapshot
    pub kv_keys_restored: Option<usize>,
    pub restart_required: bool,
}

impl BackupService {
    /// Replace the live databases and preferences with a remote archive.
    pub async fn restore_from_backup(&self, file_id: &str) -> Result<RestoreReport> {
        let _guard = self.try_begin()?;
        let _pending = RestorePending::raise(self)?;

        info!(file_id, "Starting restore");
        self.events.publish(BackupEvent::RestoreStarted {
            file_id: file_id.to_string(),
        });

        match self.run_restore(file_id).await {
            Ok(report) => {
                self.events.publish(BackupEvent::RestoreCompleted {
                    file_id: file_id.to_string(),
                    restored_files: report.restored_files.clone(),
                    kv_keys_restored: report.kv_keys_restored.unwrap_or(0),
                });
                info!(
                    file_id,
                    files = report.restored_files.len(),
                    "Restore complete, restart required"
                );
                Ok(report)
            }
            Err(e) => {
                error!(file_id, "Restore failed: {}", e);
                self.events.publish(BackupEvent::RestoreFailed {
                    file_id: file_id.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_restore(&self, file_id: &str) -> Result<RestoreReport> {
        let work_dir = self.scratch_dir.join(RESTORE_SCRATCH);
        clear_scratch(&work_dir).await;
        tokio::fs::create_dir_all(&work_dir).await?;

        self.set_phase(Phase::Downloading);
        let download = work_dir.join(DOWNLOAD_FILE);
        self.client.download_file(file_id, &download).await?;

        self.set_phase(Phase::Restoring);
        let mut report = {
            let unpack_dir = work_dir.join(UNPACK_DIR);
            let databases = self.databases.clone();
            let locator = Arc::clone(&self.locator);
            let store = Arc::clone(&self.store);

            tokio::task::spawn_blocking(move || {
                apply_restore(
                    &download,
                    &unpack_dir,
                    &databases,
                    locator.as_ref(),
                    store.as_ref(),
                )
            })
            .await??
        };

        self.store.set(REMOTE_FILE_ID_KEY, file_id)?;
        clear_scratch(&work_dir).await;

        report.file_id = file_id.to_string();
        report.restart_required = true;
        Ok(report)
    }

    /// Newest archive named for `owner_id`, if any.
    pub async fn find_latest_backup(&self, owner_id: &str) -> Result<Option<RemoteFile>> {
        let name = archive::archive_name(owner_id);
        let files = self.client.list_files(Some(&name)).await?;
        debug!(owner = owner_id, candidates = files.len(), "Looking up latest backup");
        Ok(latest(files))
    }

    /// Post-login check: offer a restore when this device has never backed
    /// up or restored, and a remote archive exists for the owner.
    pub async fn login_restore_check(&self, owner_id: &str) -> Result<Option<RemoteFile>> {
        if let Some(id) = self.remote_file_id()? {
            debug!(file_id = %id, "Device already linked to a remote backup");
            return Ok(None);
        }
        self.find_latest_backup(owner_id).await
    }
}

fn latest(files: Vec<RemoteFile>) -> Option<RemoteFile> {
    let parsed = |f: &RemoteFile| -> Option<DateTime<FixedOffset>> {
        f.modified_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
    };
    files.into_iter().max_by(|a, b| parsed(a).cmp(&parsed(b)))
}

/// Unpack `archive_path` and apply it to the live files and preference store.
pub(crate) fn apply_restore(
    archive_path: &Path,
    unpack_dir: &Path,
    databases: &[String],
    locator: &dyn DatabaseLocator,
    store: &dyn KeyValueStore,
) -> Result<RestoreReport> {
    archive::unpack(archive_path, unpack_dir)?;
    let data_dir = archive::data_dir_of(unpack_dir);
    let mut report = RestoreReport::default();

    for name in databases {
        let backup_main = data_dir.join(name);
        if !backup_main.is_file() {
            info!(db = %name, "Not in backup, leaving live database untouched");
            continue;
        }

        let live = locator.resolve(name);
        if let Some(parent) = live.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&backup_main, &live)?;
        report.restored_files.push(name.clone());

        for suffix in SIDE_FILE_SUFFIXES {
            let side_name = format!("{name}{suffix}");
            let from_backup = data_dir.join(&side_name);
            let live_side = side_file(&live, suffix);

            if from_backup.is_file() {
                std::fs::copy(&from_backup, &live_side)?;
                report.restored_files.push(side_name);
            } else if live_side.exists() {
                // a stale log would be replayed over the restored main file
                std::fs::remove_file(&live_side)?;
                report.removed_files.push(side_name);
            }
        }
    }

    let kv_path = data_dir.join(KV_SNAPSHOT_FILE);
    if kv_path.is_file() {
        let entries: BTreeMap<String, String> = serde_json::from_slice(&std::fs::read(&kv_path)?)?;
        report.kv_keys_restored = Some(kv::restore_entries(store, &entries)?);
    } else {
        warn!("Archive has no preference snapshot, preferences left as they are");
    }

    Ok(report)
}

/// Raised for the life of a restore, in memory and in the store.
struct RestorePending<'a> {
    service: &'a BackupService,
}

impl<'a> RestorePending<'a> {
    fn raise(service: &'a BackupService) -> Result<Self> {
        service.restore_pending.store(true, Ordering::Release);
        // from here on Drop lowers the flag, even if persisting fails
        let pending = Self { service };
        service.store.set_flag(RESTORE_PENDING_KEY, true)?;
        Ok(pending)
    }
}

impl Drop for RestorePending<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.service.store.set_flag(RESTORE_PENDING_KEY, false) {
            warn!("Failed to clear restore-pending flag: {}", e);
        }
        self.service.restore_pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support;
    use super::*;
    use crate::kv::{SqliteKvStore, AUTH_TOKEN_KEY};
    use crate::snapshot::locator::SqliteLocator;
    use crate::utils::errors::{BackupError, StoreError};
    use std::io::Write;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn zip_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            for (name, body) in entries {
                zip.start_file(*name, zip::write::FileOptions::default())
                    .unwrap();
                zip.write_all(body).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    fn dbs() -> Vec<String> {
        vec!["accountsDB.db".to_string(), "ledgerDB.db".to_string()]
    }

    #[test]
    fn test_only_archived_database_is_replaced() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live");
        std::fs::create_dir_all(&live).unwrap();
        for (name, body) in [
            ("accountsDB.db", "old-accounts"),
            ("accountsDB.db-wal", "stale-wal"),
            ("accountsDB.db-shm", "stale-shm"),
            ("ledgerDB.db", "live-ledger"),
            ("ledgerDB.db-wal", "live-ledger-wal"),
        ] {
            std::fs::write(live.join(name), body).unwrap();
        }

        let archive = dir.path().join("dl.zip");
        std::fs::write(&archive, zip_with(&[("data/accountsDB.db", b"new-accounts")])).unwrap();

        let store = SqliteKvStore::open(&dir.path().join("prefs.db")).unwrap();
        store.set("theme", "light").unwrap();
        let locator = SqliteLocator::new(live.clone(), vec![]);

        let report = apply_restore(&archive, &dir.path().join("unpacked"), &dbs(), &locator, &store)
            .unwrap();

        assert_eq!(report.restored_files, vec!["accountsDB.db"]);
        assert_eq!(report.removed_files, vec!["accountsDB.db-wal", "accountsDB.db-shm"]);
        assert_eq!(report.kv_keys_restored, None);
        assert_eq!(std::fs::read_to_string(live.join("accountsDB.db")).unwrap(), "new-accounts");
        assert!(!live.join("accountsDB.db-wal").exists());
        assert!(!live.join("accountsDB.db-shm").exists());
        assert_eq!(std::fs::read_to_string(live.join("ledgerDB.db")).unwrap(), "live-ledger");
        assert_eq!(
            std::fs::read_to_string(live.join("ledgerDB.db-wal")).unwrap(),
            "live-ledger-wal"
        );
        // no snapshot in the archive: preferences untouched
        assert_eq!(store.get("theme").unwrap().as_deref(), Some("light"));
    }

    #[test]
    fn test_root_layout_and_preferences() {
        let dir = TempDir::new().unwrap();
        let live = dir.path().join("live");
        std::fs::create_dir_all(&live).unwrap();

        let archive = dir.path().join("dl.zip");
        std::fs::write(
            &archive,
            zip_with(&[
                ("ledgerDB.db", b"ledger"),
                ("ledgerDB.db-wal", b"wal"),
                ("asyncStorage.json", br#"{"theme":"dark","authToken":"STOLEN"}"#),
            ]),
        )
        .unwrap();

        let store = SqliteKvStore::open(&dir.path().join("prefs.db")).unwrap();
        store.set(AUTH_TOKEN_KEY, "T1").unwrap();
        store.set("theme", "light").unwrap();
        store.set("obsolete", "x").unwrap();
        let locator = SqliteLocator::new(live.clone(), vec![]);

        let report = apply_restore(&archive, &dir.path().join("unpacked"), &dbs(), &locator, &store)
            .unwrap();

        assert_eq!(report.restored_files, vec!["ledgerDB.db", "ledgerDB.db-wal"]);
        assert_eq!(report.kv_keys_restored, Some(1));
        assert_eq!(std::fs::read(live.join("ledgerDB.db-wal")).unwrap(), b"wal");

        let all = store.all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["theme"], "dark");
        assert_eq!(all[AUTH_TOKEN_KEY], "T1");
    }

    #[tokio::test]
    async fn test_failed_download_touches_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let service = test_support::service(&dir, &server.uri());
        std::fs::write(dir.path().join("live/ledgerDB.db"), b"live").unwrap();
        service.store().set("theme", "light").unwrap();

        let err = service.restore_from_backup("f1").await.unwrap_err();
        assert!(matches!(err, BackupError::Store(StoreError::Status { status: 403, .. })));
        assert_eq!(std::fs::read(dir.path().join("live/ledgerDB.db")).unwrap(), b"live");
        assert_eq!(service.store().get("theme").unwrap().as_deref(), Some("light"));
        assert!(service.remote_file_id().unwrap().is_none());
        assert!(!service.is_restore_pending());
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn test_restore_remembers_file_and_clears_pending() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files/f1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(zip_with(&[
                ("data/ledgerDB.db", b"restored"),
                ("data/asyncStorage.json", br#"{"theme":"dark"}"#),
            ])))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let service = test_support::service(&dir, &server.uri());

        let report = service.restore_from_backup("f1").await.unwrap();
        assert!(report.restart_required);
        assert_eq!(report.file_id, "f1");
        assert_eq!(service.remote_file_id().unwrap().as_deref(), Some("f1"));
        assert!(!service.is_restore_pending());
        assert_eq!(service.store().get("theme").unwrap().as_deref(), Some("dark"));
        assert_eq!(
            std::fs::read(dir.path().join("live/ledgerDB.db")).unwrap(),
            b"restored"
        );
        assert!(!dir.path().join("scratch").join(RESTORE_SCRATCH).exists());
    }

    #[tokio::test]
    async fn test_login_check_offers_latest_only_to_unlinked_device() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/v3/files"))
            .and(query_param("q", "name = 'backup_u1.zip'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "files": [
                    { "id": "older", "name": "backup_u1.zip", "modifiedTime": "2026-01-01T00:00:00Z" },
                    { "id": "newer", "name": "backup_u1.zip", "modifiedTime": "2026-03-01T00:00:00+01:00" },
                    { "id": "undated", "name": "backup_u1.zip" }
                ]
            })))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let service = test_support::service(&dir, &server.uri());

        let offered = service.login_restore_check("u1").await.unwrap().unwrap();
        assert_eq!(offered.id, "newer");

        service.store().set(REMOTE_FILE_ID_KEY, "newer").unwrap();
        assert!(service.login_restore_check("u1").await.unwrap().is_none());
    }
}
