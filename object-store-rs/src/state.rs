use crate::config::AppConfig;
use crate::db::connection::DbPool;
use dashmap::DashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// An open resumable upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Set when the session replaces an existing file's content
    pub file_id: Option<String>,
    pub name: String,
    pub space: String,
    pub mime_type: String,
    pub total_bytes: u64,
    pub received_bytes: u64,
    pub part_path: PathBuf,
    /// Last time the session was opened or received bytes
    pub touched_at: Instant,
}

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub sessions: DashMap<String, UploadSession>,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig) -> Self {
        Self {
            db,
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn blob_path(&self, file_id: &str) -> PathBuf {
        self.config.blobs_dir.join(file_id)
    }

    /// Drop sessions idle for at least `ttl` and delete their partial files.
    pub async fn reap_sessions(&self, ttl: Duration) -> usize {
        let mut stale = Vec::new();
        self.sessions.retain(|_, session| {
            let keep = session.touched_at.elapsed() < ttl;
            if !keep {
                stale.push(session.part_path.clone());
            }
            keep
        });

        for part in &stale {
            if let Err(e) = tokio::fs::remove_file(part).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %part.display(), "Failed to remove partial upload: {}", e);
                }
            }
        }
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "Reaped idle upload sessions");
        }
        stale.len()
    }
}
