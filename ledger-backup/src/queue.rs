//! Auto-backup queue: coalesces bursts of data mutations into one backup.
//!
//! A single pending slot holds the latest request. Each enqueue replaces the
//! slot and restarts the idle timer; when the timer fires the slot is
//! consumed and one backup runs with the last request seen.

use crate::events::BackupEvent;
use crate::executor::{BackupRequest, BackupService};
use crate::remote::RemoteFile;
use crate::utils::errors::{BackupError, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

const ALREADY_RUNNING: &str = "a backup or restore is already running";

/// What the queue fires backups against.
pub trait BackupTarget: Send + Sync + 'static {
    fn auto_backup_enabled(&self) -> bool;

    fn restore_pending(&self) -> bool;

    fn is_running(&self) -> bool;

    fn run_backup(&self, request: BackupRequest) -> impl Future<Output = Result<RemoteFile>> + Send;

    /// Called when a fired run is dropped by a guard.
    fn skipped(&self, _reason: &str) {}
}

impl BackupTarget for BackupService {
    fn auto_backup_enabled(&self) -> bool {
        match BackupService::auto_backup_enabled(self) {
            Ok(enabled) => enabled,
            Err(e) => {
                warn!("Failed to read auto-backup flag: {}", e);
                false
            }
        }
    }

    fn restore_pending(&self) -> bool {
        self.is_restore_pending()
    }

    fn is_running(&self) -> bool {
        BackupService::is_running(self)
    }

    fn run_backup(&self, request: BackupRequest) -> impl Future<Output = Result<RemoteFile>> + Send {
        self.perform_backup(request)
    }

    fn skipped(&self, reason: &str) {
        self.events().publish(BackupEvent::BackupSkipped {
            reason: reason.to_string(),
        });
    }
}

struct Pending {
    generation: u64,
    request: BackupRequest,
    timer: AbortHandle,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    pending: Option<Pending>,
}

pub struct AutoBackupQueue<T: BackupTarget> {
    target: Arc<T>,
    debounce: Duration,
    slot: Arc<Mutex<Slot>>,
}

impl<T: BackupTarget> AutoBackupQueue<T> {
    pub fn new(target: Arc<T>, debounce: Duration) -> Self {
        Self {
            target,
            debounce,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Schedule a backup after the idle window, replacing any pending one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, request: BackupRequest) {
        let mut slot = lock(&self.slot);
        slot.generation += 1;
        let generation = slot.generation;

        if let Some(previous) = slot.pending.take() {
            previous.timer.abort();
            debug!(generation, "Replacing pending auto-backup");
        }

        let target = Arc::clone(&self.target);
        let slot_ref = Arc::clone(&self.slot);
        let debounce = self.debounce;

        // the slot lock is held until `pending` is stored, so the timer can
        // never observe the slot before its own entry is in it
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;

            let request = {
                let mut slot = lock(&slot_ref);
                let current = slot.pending.as_ref().map(|p| p.generation) == Some(generation);
                if current {
                    slot.pending.take().map(|p| p.request)
                } else {
                    None
                }
            };

            if let Some(request) = request {
                fire(target.as_ref(), request).await;
            }
        });

        slot.pending = Some(Pending {
            generation,
            request,
            timer: handle.abort_handle(),
        });
    }

    /// Drop the pending slot, if any. A backup already firing is not affected.
    pub fn cancel(&self) -> bool {
        match lock(&self.slot).pending.take() {
            Some(pending) => {
                pending.timer.abort();
                info!("Pending auto-backup cancelled");
                true
            }
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn fire<T: BackupTarget>(target: &T, request: BackupRequest) {
    let skip = if !target.auto_backup_enabled() {
        Some("auto-backup disabled")
    } else if target.restore_pending() {
        Some("restore pending")
    } else if target.is_running() {
        Some(ALREADY_RUNNING)
    } else {
        None
    };

    if let Some(reason) = skip {
        info!("Skipping auto-backup: {}", reason);
        target.skipped(reason);
        return;
    }

    match target.run_backup(request).await {
        Ok(file) => info!(file_id = %file.id, "Auto-backup complete"),
        // lost the race to a run that started after the guard check
        Err(BackupError::AlreadyRunning) => {
            info!("Skipping auto-backup: {}", ALREADY_RUNNING);
            target.skipped(ALREADY_RUNNING);
        }
        // already published on the event bus by the target
        Err(e) => error!("Auto-backup failed: {}", e),
    }
}
