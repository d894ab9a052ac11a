//! Backup orchestration: snapshot, package, upload, record.

use super::{clear_scratch, BackupService, Phase};
use crate::archive;
use crate::events::{BackupEvent, UploadProgressPayload};
use crate::kv::{KeyValueStore, ACCOUNT_EMAIL_KEY, LAST_MANIFEST_KEY, LAST_SUCCESS_KEY, REMOTE_FILE_ID_KEY};
use crate::remote::{RemoteFile, UploadRequest};
use crate::snapshot::{self, manifest::Manifest, Snapshot};
use crate::transfer::progress::{format_bytes, ProgressTracker};
use crate::transfer::progress_stream::ProgressCallback;
use crate::utils::errors::{Result, StoreError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

pub(super) const BACKUP_SCRATCH: &str = "backup";
const STAGING_DIR: &str = "staging";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub owner_id: String,
    pub account_email: String,
}

impl BackupService {
    /// Capture the live state and push it to the owner's remote archive.
    ///
    /// Repeated runs update the remembered remote file in place. Bookkeeping
    /// keys are only written after the upload succeeds.
    pub async fn perform_backup(&self, request: BackupRequest) -> Result<RemoteFile> {
        let _guard = self.try_begin()?;
        let run_id = Uuid::new_v4().to_string();

        info!(run_id = %run_id, owner = %request.owner_id, "Starting backup");
        self.events.publish(BackupEvent::BackupStarted {
            run_id: run_id.clone(),
            owner_id: request.owner_id.clone(),
        });

        match self.run_backup(&run_id, &request).await {
            Ok((file, manifest)) => {
                self.events.publish(BackupEvent::BackupCompleted {
                    run_id,
                    file_id: file.id.clone(),
                    size: file.size,
                    db_files: manifest.db_files,
                });
                Ok(file)
            }
            Err(e) => {
                error!(run_id = %run_id, "Backup failed: {}", e);
                self.events.publish(BackupEvent::BackupFailed {
                    run_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_backup(
        &self,
        run_id: &str,
        request: &BackupRequest,
    ) -> Result<(RemoteFile, Manifest)> {
        let work_dir = self.scratch_dir.join(BACKUP_SCRATCH);
        let staging = work_dir.join(STAGING_DIR);
        let file_name = archive::archive_name(&request.owner_id);

        self.set_phase(Phase::Snapshotting);
        let snapshot = {
            let work_dir = work_dir.clone();
            let staging = staging.clone();
            let owner_id = request.owner_id.clone();
            let databases = self.databases.clone();
            let locator = Arc::clone(&self.locator);
            let store = Arc::clone(&self.store);

            tokio::task::spawn_blocking(move || -> Result<Snapshot> {
                // leftovers of an earlier failed run
                if work_dir.exists() {
                    std::fs::remove_dir_all(&work_dir)?;
                }
                snapshot::build_snapshot(
                    &staging,
                    &owner_id,
                    &databases,
                    locator.as_ref(),
                    store.as_ref(),
                )
            })
            .await??
        };

        self.set_phase(Phase::Packaging);
        let archive_path = {
            let staging = snapshot.staging_root.clone();
            let target = work_dir.join(&file_name);
            tokio::task::spawn_blocking(move || archive::package(&staging, &target)).await??
        };
        let total_bytes = tokio::fs::metadata(&archive_path).await?.len();

        self.set_phase(Phase::Uploading);
        let remembered = self.store.get(REMOTE_FILE_ID_KEY)?;
        let progress = self.progress_callback(run_id, total_bytes);
        let upload = |existing_file_id: Option<String>| UploadRequest {
            file_path: archive_path.clone(),
            file_name: file_name.clone(),
            existing_file_id,
        };

        info!(
            run_id,
            size = %format_bytes(total_bytes),
            update = remembered.is_some(),
            "Uploading archive"
        );
        let file = match self
            .client
            .upload_file(&upload(remembered.clone()), Some(Arc::clone(&progress)))
            .await
        {
            Err(StoreError::NotFound(id)) if remembered.as_deref() == Some(id.as_str()) => {
                warn!(file_id = %id, "Remembered remote file is gone, creating a new one");
                self.client.upload_file(&upload(None), Some(progress)).await?
            }
            result => result?,
        };

        let mut bookkeeping = BTreeMap::new();
        bookkeeping.insert(REMOTE_FILE_ID_KEY.to_string(), file.id.clone());
        bookkeeping.insert(LAST_SUCCESS_KEY.to_string(), chrono::Utc::now().to_rfc3339());
        bookkeeping.insert(ACCOUNT_EMAIL_KEY.to_string(), request.account_email.clone());
        bookkeeping.insert(
            LAST_MANIFEST_KEY.to_string(),
            serde_json::to_string(&snapshot.manifest)?,
        );
        self.store.set_many(&bookkeeping)?;
        self.set_phase(Phase::Recorded);

        info!(run_id, file_id = %file.id, "Backup recorded");
        clear_scratch(&work_dir).await;

        Ok((file, snapshot.manifest))
    }

    fn progress_callback(&self, run_id: &str, total_bytes: u64) -> ProgressCallback {
        let tracker = Mutex::new(ProgressTracker::new(total_bytes));
        let events = self.events.clone();
        let run_id = run_id.to_string();

        Arc::new(move |sent| {
            let sample = match tracker.lock() {
                Ok(mut tracker) => tracker.record(sent),
                Err(_) => None,
            };
            if let Some(progress) = sample {
                events.publish(BackupEvent::UploadProgress(UploadProgressPayload::new(
                    &run_id, &progress,
                )));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support;
    use super::*;
    use crate::utils::errors::BackupError;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> BackupRequest {
        BackupRequest {
            owner_id: "u1".to_string(),
            account_email: "me@example.com".to_string(),
        }
    }

    async fn mount_upload(server: &MockServer, open_method: &str, open_path: &str, id: &str) {
        Mock::given(method(open_method))
            .and(path(open_path))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Location", format!("{}/upload/session/s1", server.uri()).as_str()),
            )
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/upload/session/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": id,
                "name": "backup_u1.zip"
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_backup_records_bookkeeping_and_clears_scratch() {
        let server = MockServer::start().await;
        mount_upload(&server, "POST", "/upload/drive/v3/files", "f-new").await;

        let dir = TempDir::new().unwrap();
        let service = test_support::service(&dir, &server.uri());
        std::fs::write(dir.path().join("live/ledgerDB.db"), b"ledger").unwrap();
        service.store().set("theme", "dark").unwrap();
        let mut events = service.events().subscribe();

        let file = service.perform_backup(request()).await.unwrap();
        assert_eq!(file.id, "f-new");

        let store = service.store();
        assert_eq!(store.get(REMOTE_FILE_ID_KEY).unwrap().as_deref(), Some("f-new"));
        assert_eq!(
            store.get(ACCOUNT_EMAIL_KEY).unwrap().as_deref(),
            Some("me@example.com")
        );
        assert!(store.get(LAST_SUCCESS_KEY).unwrap().is_some());
        let manifest: Manifest =
            serde_json::from_str(&store.get(LAST_MANIFEST_KEY).unwrap().unwrap()).unwrap();
        assert_eq!(manifest.db_files, vec!["ledgerDB.db"]);

        assert!(!dir.path().join("scratch").join(BACKUP_SCRATCH).exists());
        assert_eq!(service.phase(), Phase::Idle);
        assert!(!service.is_running());

        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            if let BackupEvent::BackupCompleted { file_id, .. } = event {
                assert_eq!(file_id, "f-new");
                completed = true;
            }
        }
        assert!(completed);
    }

    #[tokio::test]
    async fn test_remembered_id_updates_in_place() {
        let server = MockServer::start().await;
        mount_upload(&server, "PATCH", "/upload/drive/v3/files/f-old", "f-old").await;

        let dir = TempDir::new().unwrap();
        let service = test_support::service(&dir, &server.uri());
        service.store().set(REMOTE_FILE_ID_KEY, "f-old").unwrap();

        let file = service.perform_backup(request()).await.unwrap();
        assert_eq!(file.id, "f-old");
    }

    #[tokio::test]
    async fn test_vanished_remote_file_falls_back_to_create() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/upload/drive/v3/files/f-gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        mount_upload(&server, "POST", "/upload/drive/v3/files", "f-fresh").await;

        let dir = TempDir::new().unwrap();
        let service = test_support::service(&dir, &server.uri());
        service.store().set(REMOTE_FILE_ID_KEY, "f-gone").unwrap();

        let file = service.perform_backup(request()).await.unwrap();
        assert_eq!(file.id, "f-fresh");
        assert_eq!(
            service.store().get(REMOTE_FILE_ID_KEY).unwrap().as_deref(),
            Some("f-fresh")
        );
    }

    #[tokio::test]
    async fn test_failed_upload_leaves_bookkeeping_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let service = test_support::service(&dir, &server.uri());

        let err = service.perform_backup(request()).await.unwrap_err();
        assert!(matches!(err, BackupError::Store(StoreError::Status { status: 500, .. })));
        assert!(service.store().get(REMOTE_FILE_ID_KEY).unwrap().is_none());
        assert!(service.store().get(LAST_SUCCESS_KEY).unwrap().is_none());
        assert_eq!(service.phase(), Phase::Idle);
        assert!(!service.is_running());
    }
}
