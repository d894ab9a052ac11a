//! Utility modules for the backup pipeline.

pub mod errors;
pub mod logger;

pub use errors::{ArchiveError, BackupError, KvError, Result, StoreError};
