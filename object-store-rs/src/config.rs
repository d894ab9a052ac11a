use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub blobs_dir: PathBuf,
    pub uploads_dir: PathBuf,
    /// Total bytes the space may hold; `None` is unlimited
    pub quota_bytes: Option<u64>,
    /// Required bearer token; `None` accepts any non-empty token
    pub access_token: Option<String>,
    /// Base for session URLs handed out in `Location`; defaults to the request's Host
    pub public_url: Option<String>,
    /// Upload sessions idle this long are dropped with their partial bytes
    pub session_ttl: Duration,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            std::env::var("STORE_DATA_DIR").unwrap_or_else(|_| "./store-data".into()),
        );

        let mut config = Self::for_dir(&data_dir);
        config.port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8089);
        config.quota_bytes = std::env::var("STORE_QUOTA_BYTES")
            .ok()
            .and_then(|v| v.parse().ok());
        config.access_token = std::env::var("STORE_ACCESS_TOKEN")
            .ok()
            .filter(|v| !v.is_empty());
        config.public_url = std::env::var("STORE_PUBLIC_URL").ok();
        if let Some(secs) = std::env::var("STORE_SESSION_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.session_ttl = Duration::from_secs(secs);
        }
        config.log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
        config
    }

    /// Defaults rooted at `data_dir`, with no quota and no fixed token.
    pub fn for_dir(data_dir: &Path) -> Self {
        Self {
            port: 8089,
            db_path: data_dir.join("object-store.db"),
            blobs_dir: data_dir.join("blobs"),
            uploads_dir: data_dir.join("uploads"),
            data_dir: data_dir.to_path_buf(),
            quota_bytes: None,
            access_token: None,
            public_url: None,
            session_ttl: DEFAULT_SESSION_TTL,
            log_level: "info".into(),
        }
    }
}
