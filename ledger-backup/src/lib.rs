//! Ledger Backup Library
//!
//! Snapshots the ledger app's SQLite databases and preferences, packages them
//! into one archive and keeps a single copy per owner in an app-private
//! remote object space. Restores reverse the process on another device.

pub mod archive;
pub mod config;
pub mod daemon;
pub mod events;
pub mod executor;
pub mod kv;
pub mod monitor;
pub mod queue;
pub mod remote;
pub mod snapshot;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{BackupRequest, BackupService, Phase, RestoreReport};
pub use utils::errors::{BackupError, Result};
