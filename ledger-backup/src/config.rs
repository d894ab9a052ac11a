//! Configuration management for the backup pipeline.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`LEDGER_BACKUP__STORE__ACCESS_TOKEN=...`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database base names captured by every backup, in capture order.
pub const DEFAULT_DATABASES: &[&str] = &["accountsDB.db", "ledgerDB.db"];

const ENV_PREFIX: &str = "LEDGER_BACKUP";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub auto_backup: AutoBackupConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable owner identifier; partitions archives by file name
    pub owner_id: String,

    /// Email of the signed-in backup account
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base URL for metadata requests (list, download, delete, quota)
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Base URL for resumable upload sessions
    #[serde(default = "default_upload_base_url")]
    pub upload_base_url: String,

    /// App-private space name
    #[serde(default = "default_space")]
    pub space: String,

    /// Bearer token; falls back to the key-value store's `authToken`
    #[serde(default)]
    pub access_token: Option<String>,

    /// Per-request deadline. Unset means the HTTP client's defaults.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// How many times an interrupted byte transfer is resumed on the same session
    #[serde(default)]
    pub resume_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the live databases
    pub data_dir: PathBuf,

    /// Extra directories searched for databases the engine relocated
    #[serde(default)]
    pub fallback_dirs: Vec<PathBuf>,

    /// Paths the host app's engine reports for its open databases, by base
    /// name. Preferred over the directory search when the file exists.
    #[serde(default)]
    pub engine_paths: BTreeMap<String, PathBuf>,

    /// Scratch directory for staging, archives and downloads
    pub scratch_dir: PathBuf,

    /// Database base names, in capture order
    #[serde(default = "default_databases")]
    pub databases: Vec<String>,

    /// Key-value store file, relative to `data_dir` unless absolute
    #[serde(default = "default_kv_store")]
    pub kv_store: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoBackupConfig {
    /// Idle window before coalesced mutations trigger a backup
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// How often `watch` looks at the database files for changes
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_api_base_url() -> String {
    "https://www.googleapis.com".to_string()
}

fn default_upload_base_url() -> String {
    "https://www.googleapis.com".to_string()
}

fn default_space() -> String {
    "appDataFolder".to_string()
}

fn default_databases() -> Vec<String> {
    DEFAULT_DATABASES.iter().map(|s| s.to_string()).collect()
}

fn default_kv_store() -> PathBuf {
    PathBuf::from("preferences.db")
}

fn default_debounce_secs() -> u64 {
    90
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            upload_base_url: default_upload_base_url(),
            space: default_space(),
            access_token: None,
            request_timeout_secs: None,
            resume_attempts: 0,
        }
    }
}

impl Default for AutoBackupConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply `LEDGER_BACKUP__*` overrides.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Create a default configuration rooted at the platform data directory
    pub fn default() -> Self {
        let data_dir = std::env::var_os("LEDGER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./ledger-data"));
        let scratch_dir = std::env::temp_dir().join("ledger-backup");

        let mut store = StoreConfig::default();
        store.access_token = std::env::var("LEDGER_BACKUP__STORE__ACCESS_TOKEN").ok();

        Config {
            account: AccountConfig {
                owner_id: std::env::var("LEDGER_BACKUP__ACCOUNT__OWNER_ID")
                    .unwrap_or_else(|_| "local".to_string()),
                email: String::new(),
            },
            store,
            storage: StorageConfig {
                data_dir,
                fallback_dirs: Vec::new(),
                engine_paths: BTreeMap::new(),
                scratch_dir,
                databases: default_databases(),
                kv_store: default_kv_store(),
            },
            auto_backup: AutoBackupConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Absolute path of the key-value store file
    pub fn kv_store_path(&self) -> PathBuf {
        if self.kv_store.is_absolute() {
            self.kv_store.clone()
        } else {
            self.data_dir.join(&self.kv_store)
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

impl AutoBackupConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
