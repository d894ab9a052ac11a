//! Pipeline events for observers (CLI output, host app status views).
//!
//! Background runs never raise to a caller; outcomes are published here.

use crate::executor::Phase;
use crate::transfer::progress::TransferProgress;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BackupEvent {
    #[serde(rename = "backup:started")]
    BackupStarted { run_id: String, owner_id: String },

    #[serde(rename = "backup:phase")]
    PhaseChanged { phase: Phase },

    #[serde(rename = "backup:progress")]
    UploadProgress(UploadProgressPayload),

    #[serde(rename = "backup:completed")]
    BackupCompleted {
        run_id: String,
        file_id: String,
        size: Option<u64>,
        db_files: Vec<String>,
    },

    #[serde(rename = "backup:failed")]
    BackupFailed { run_id: String, error: String },

    /// An auto-backup fired but a guard dropped it
    #[serde(rename = "backup:skipped")]
    BackupSkipped { reason: String },

    #[serde(rename = "restore:started")]
    RestoreStarted { file_id: String },

    #[serde(rename = "restore:completed")]
    RestoreCompleted {
        file_id: String,
        restored_files: Vec<String>,
        kv_keys_restored: usize,
    },

    #[serde(rename = "restore:failed")]
    RestoreFailed { file_id: String, error: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadProgressPayload {
    pub run_id: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub bytes_per_second: u64,
    pub eta_seconds: u64,
    pub percent_complete: f64,
}

impl UploadProgressPayload {
    pub fn new(run_id: &str, progress: &TransferProgress) -> Self {
        Self {
            run_id: run_id.to_string(),
            total_bytes: progress.total_bytes,
            transferred_bytes: progress.transferred_bytes,
            bytes_per_second: progress.bytes_per_second,
            eta_seconds: progress.eta_seconds,
            percent_complete: progress.percent_complete,
        }
    }
}

/// Fan-out channel for [`BackupEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackupEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers; with none, the event is dropped.
    pub fn publish(&self, event: BackupEvent) {
        if self.tx.send(event).is_err() {
            debug!("No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(BackupEvent::BackupFailed {
            run_id: "r1".to_string(),
            error: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "backup:failed");
        assert_eq!(json["payload"]["error"], "boom");

        let json = serde_json::to_value(BackupEvent::PhaseChanged {
            phase: Phase::Uploading,
        })
        .unwrap();
        assert_eq!(json["payload"]["phase"], "uploading");
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BackupEvent::BackupSkipped {
            reason: "auto-backup disabled".to_string(),
        });

        match rx.recv().await.unwrap() {
            BackupEvent::BackupSkipped { reason } => assert_eq!(reason, "auto-backup disabled"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        EventBus::new().publish(BackupEvent::RestoreStarted {
            file_id: "f1".to_string(),
        });
    }
}
