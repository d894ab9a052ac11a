//! Backup service: owns the bookkeeping, the running flag and the
//! backup/restore orchestrators.
//!
//! One instance is built at startup and shared behind an `Arc`. Backup and
//! restore share a single running flag, so at most one of them touches the
//! live files or the remote archive at a time.

pub mod backup;
pub mod restore;

use crate::config::Config;
use crate::events::{BackupEvent, EventBus};
use crate::kv::{
    self, KeyValueStore, SqliteKvStore, ACCOUNT_EMAIL_KEY, AUTO_BACKUP_ENABLED_KEY,
    LAST_MANIFEST_KEY, LAST_SUCCESS_KEY, REMOTE_FILE_ID_KEY, RESTORE_PENDING_KEY,
};
use crate::remote::DriveClient;
use crate::snapshot::locator::{DatabaseLocator, SqliteLocator};
use crate::snapshot::manifest::Manifest;
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

pub use backup::BackupRequest;
pub use restore::RestoreReport;

/// Where a run currently is. Every run ends back at `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Snapshotting,
    Packaging,
    Uploading,
    Recorded,
    Downloading,
    Restoring,
}

/// Point-in-time view of the service and its bookkeeping keys.
#[derive(Debug, Clone, Serialize)]
pub struct BackupStatus {
    pub phase: Phase,
    pub running: bool,
    pub restore_pending: bool,
    pub auto_backup_enabled: bool,
    pub remote_file_id: Option<String>,
    pub last_success_at: Option<String>,
    pub account_email: Option<String>,
    pub last_manifest: Option<Manifest>,
}

pub struct BackupService {
    client: DriveClient,
    store: Arc<dyn KeyValueStore>,
    locator: Arc<dyn DatabaseLocator>,
    databases: Vec<String>,
    scratch_dir: PathBuf,
    events: EventBus,
    phase_tx: watch::Sender<Phase>,
    running: AtomicBool,
    restore_pending: AtomicBool,
}

impl BackupService {
    pub fn new(
        client: DriveClient,
        store: Arc<dyn KeyValueStore>,
        locator: Arc<dyn DatabaseLocator>,
        databases: Vec<String>,
        scratch_dir: PathBuf,
    ) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        Self {
            client,
            store,
            locator,
            databases,
            scratch_dir,
            events: EventBus::new(),
            phase_tx,
            running: AtomicBool::new(false),
            restore_pending: AtomicBool::new(false),
        }
    }

    /// Wire up the SQLite key-value store, the locator and the HTTP client.
    ///
    /// The bearer token comes from the config when set, otherwise from the
    /// store's `authToken` key.
    pub async fn from_config(config: &Config) -> Result<Self> {
        if config.account.owner_id.trim().is_empty() {
            return Err(BackupError::Config("account.owner_id is empty".to_string()));
        }

        let store = SqliteKvStore::open(&config.storage.kv_store_path())?;
        let locator = SqliteLocator::new(
            config.storage.data_dir.clone(),
            config.storage.fallback_dirs.clone(),
        )
        .with_engine_paths(config.storage.engine_paths.clone());
        let client = DriveClient::new(&config.store)?;

        if config.store.access_token.is_none() {
            client.set_access_token(store.get(kv::AUTH_TOKEN_KEY)?).await;
        }

        Ok(Self::new(
            client,
            Arc::new(store),
            Arc::new(locator),
            config.storage.databases.clone(),
            config.storage.scratch_dir.clone(),
        ))
    }

    pub fn client(&self) -> &DriveClient {
        &self.client
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn databases(&self) -> &[String] {
        &self.databases
    }

    pub fn locator(&self) -> &Arc<dyn DatabaseLocator> {
        &self.locator
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// True while a restore is in flight here, or when a previous one never
    /// cleared its persisted flag.
    pub fn is_restore_pending(&self) -> bool {
        if self.restore_pending.load(Ordering::Acquire) {
            return true;
        }
        match self.store.get_flag(RESTORE_PENDING_KEY) {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Failed to read restore-pending flag: {}", e);
                false
            }
        }
    }

    pub fn auto_backup_enabled(&self) -> Result<bool> {
        Ok(self.store.get_flag(AUTO_BACKUP_ENABLED_KEY)?)
    }

    pub fn set_auto_backup(&self, enabled: bool) -> Result<()> {
        self.store.set_flag(AUTO_BACKUP_ENABLED_KEY, enabled)?;
        debug!(enabled, "Auto-backup toggled");
        Ok(())
    }

    pub fn remote_file_id(&self) -> Result<Option<String>> {
        Ok(self.store.get(REMOTE_FILE_ID_KEY)?)
    }

    pub fn status(&self) -> Result<BackupStatus> {
        let last_manifest = match self.store.get(LAST_MANIFEST_KEY)? {
            Some(json) => match serde_json::from_str(&json) {
                Ok(manifest) => Some(manifest),
                Err(e) => {
                    warn!("Ignoring unreadable stored manifest: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(BackupStatus {
            phase: self.phase(),
            running: self.is_running(),
            restore_pending: self.is_restore_pending(),
            auto_backup_enabled: self.auto_backup_enabled()?,
            remote_file_id: self.store.get(REMOTE_FILE_ID_KEY)?,
            last_success_at: self.store.get(LAST_SUCCESS_KEY)?,
            account_email: self.store.get(ACCOUNT_EMAIL_KEY)?,
            last_manifest,
        })
    }

    fn set_phase(&self, phase: Phase) {
        self.phase_tx.send_replace(phase);
        self.events.publish(BackupEvent::PhaseChanged { phase });
    }

    /// Claim the running flag, or fail if another run holds it.
    fn try_begin(&self) -> Result<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BackupError::AlreadyRunning)?;
        Ok(RunGuard { service: self })
    }
}

/// Releases the running flag and returns the phase to `Idle` on drop,
/// whether the run succeeded, failed or was dropped mid-await.
struct RunGuard<'a> {
    service: &'a BackupService,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.service.set_phase(Phase::Idle);
        self.service.running.store(false, Ordering::Release);
    }
}

/// Remove a scratch directory, logging rather than failing.
async fn clear_scratch(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to clear scratch directory {}: {}", dir.display(), e);
        }
    }
}
