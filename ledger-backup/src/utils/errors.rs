//! Error types for the backup pipeline.

use thiserror::Error;

/// Errors raised by the remote object store client.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("authentication required: no access token set")]
    AuthRequired,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("remote store returned {status} for {operation}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("remote file not found: {0}")]
    NotFound(String),

    #[error("upload session response carried no Location header")]
    MissingSessionUrl,

    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while writing or reading the backup archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("staging directory not found: {0}")]
    StagingNotFound(String),

    #[error("archive entry escapes the destination: {0}")]
    UnsafeEntry(String),
}

/// Errors raised by the key-value configuration store.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level pipeline error.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Remote store error: {0}")]
    Store(#[from] StoreError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Key-value store error: {0}")]
    Kv(#[from] KvError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("a backup or restore is already running")]
    AlreadyRunning,

    #[error("no backup found for owner {0}")]
    NoBackupFound(String),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, BackupError>;
