//! Key-value configuration store.
//!
//! The app keeps its preferences and session state as flat string pairs.
//! A subset of keys (the deny-list) holds live auth and backup bookkeeping
//! state and must never travel inside an archive.

use crate::utils::errors::KvError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::collections::BTreeMap;
use std::path::Path;

pub type KvResult<T> = std::result::Result<T, KvError>;

pub const AUTH_TOKEN_KEY: &str = "authToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const REMOTE_FILE_ID_KEY: &str = "backup.remoteFileId";
pub const LAST_SUCCESS_KEY: &str = "backup.lastSuccessAt";
pub const ACCOUNT_EMAIL_KEY: &str = "backup.accountEmail";
pub const LAST_MANIFEST_KEY: &str = "backup.lastManifest";
pub const RESTORE_PENDING_KEY: &str = "backup.restorePending";
pub const AUTO_BACKUP_ENABLED_KEY: &str = "backup.autoEnabled";

/// Keys excluded from snapshots and preserved across restores.
pub const DENY_LIST: &[&str] = &[
    AUTH_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    REMOTE_FILE_ID_KEY,
    LAST_SUCCESS_KEY,
    ACCOUNT_EMAIL_KEY,
    LAST_MANIFEST_KEY,
    RESTORE_PENDING_KEY,
];

pub fn is_denied(key: &str) -> bool {
    DENY_LIST.contains(&key)
}

/// Flat string store with whole-store read and wipe.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> KvResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> KvResult<()>;

    fn remove(&self, key: &str) -> KvResult<()>;

    fn all(&self) -> KvResult<BTreeMap<String, String>>;

    fn clear(&self) -> KvResult<()>;

    fn set_many(&self, entries: &BTreeMap<String, String>) -> KvResult<()> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Wipe the store, then write `restored` followed by `preserved`.
    ///
    /// Stores that can should do this atomically; a failure part-way must
    /// not leave the store wiped.
    fn replace_all(
        &self,
        restored: &BTreeMap<String, String>,
        preserved: &BTreeMap<String, String>,
    ) -> KvResult<()> {
        self.clear()?;
        self.set_many(restored)?;
        self.set_many(preserved)
    }

    fn get_flag(&self, key: &str) -> KvResult<bool> {
        Ok(self.get(key)?.as_deref() == Some("true"))
    }

    fn set_flag(&self, key: &str, on: bool) -> KvResult<()> {
        if on {
            self.set(key, "true")
        } else {
            self.remove(key)
        }
    }
}

/// Every pair of the store except deny-listed keys.
pub fn exportable_entries(store: &dyn KeyValueStore) -> KvResult<BTreeMap<String, String>> {
    let mut entries = store.all()?;
    entries.retain(|key, _| !is_denied(key));
    Ok(entries)
}

/// Replace the store contents with `restored`, keeping live deny-listed values.
///
/// Deny-listed values are read before the wipe and written back last, so a
/// snapshot can never clobber live auth or bookkeeping state. Deny-listed
/// keys carried by `restored` itself are ignored.
pub fn restore_entries(
    store: &dyn KeyValueStore,
    restored: &BTreeMap<String, String>,
) -> KvResult<usize> {
    let mut preserved = BTreeMap::new();
    for key in DENY_LIST {
        if let Some(value) = store.get(key)? {
            preserved.insert(key.to_string(), value);
        }
    }

    let incoming: BTreeMap<String, String> = restored
        .iter()
        .filter(|(key, _)| !is_denied(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    store.replace_all(&incoming, &preserved)?;

    Ok(incoming.len())
}

const UPSERT: &str =
    "INSERT INTO kv (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);";

/// SQLite-backed store, one row per key.
#[derive(Clone)]
pub struct SqliteKvStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteKvStore {
    pub fn open(path: &Path) -> KvResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder().max_size(4).build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             PRAGMA synchronous = FULL;",
        )?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { pool })
    }
}

impl KeyValueStore for SqliteKvStore {
    fn get(&self, key: &str) -> KvResult<Option<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    fn set(&self, key: &str, value: &str) -> KvResult<()> {
        let conn = self.pool.get()?;
        conn.execute(UPSERT, params![key, value])?;
        Ok(())
    }

    fn remove(&self, key: &str) -> KvResult<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM kv WHERE key = ?", params![key])?;
        Ok(())
    }

    fn all(&self) -> KvResult<BTreeMap<String, String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT key, value FROM kv")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = BTreeMap::new();
        for r in rows {
            let (k, v) = r?;
            map.insert(k, v);
        }
        Ok(map)
    }

    fn clear(&self) -> KvResult<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }

    fn set_many(&self, entries: &BTreeMap<String, String>) -> KvResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT)?;
            for (key, value) in entries {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn replace_all(
        &self,
        restored: &BTreeMap<String, String>,
        preserved: &BTreeMap<String, String>,
    ) -> KvResult<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM kv", [])?;
        {
            let mut stmt = tx.prepare(UPSERT)?;
            for (key, value) in restored.iter().chain(preserved) {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
