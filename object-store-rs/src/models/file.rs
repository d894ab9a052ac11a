use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

/// File metadata as returned on the wire.
///
/// Sizes are decimal strings, as the real service encodes int64 fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size: String,
    pub created_time: String,
    pub modified_time: String,
    pub parents: Vec<String>,
}

impl StoredFile {
    pub fn size_bytes(&self) -> u64 {
        self.size.parse().unwrap_or(0)
    }
}

fn row_to_file(row: &Row) -> rusqlite::Result<StoredFile> {
    let size: i64 = row.get("size")?;
    let space: String = row.get("space")?;
    Ok(StoredFile {
        id: row.get("id")?,
        name: row.get("name")?,
        mime_type: row.get("mime_type")?,
        size: size.to_string(),
        created_time: row.get("created_time")?,
        modified_time: row.get("modified_time")?,
        parents: vec![space],
    })
}

/// Files in `space`, optionally restricted to an exact name, newest first.
pub fn find_all(
    conn: &Connection,
    space: Option<&str>,
    name: Option<&str>,
) -> anyhow::Result<Vec<StoredFile>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM files
         WHERE (?1 IS NULL OR space = ?1) AND (?2 IS NULL OR name = ?2)
         ORDER BY modified_time DESC",
    )?;
    let rows = stmt.query_map(params![space, name], |row| row_to_file(row))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<StoredFile>> {
    let mut stmt = conn.prepare("SELECT * FROM files WHERE id = ?")?;
    Ok(stmt.query_row(params![id], |row| row_to_file(row)).optional()?)
}

pub struct UpsertFileData<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub space: &'a str,
    pub mime_type: &'a str,
    pub size: u64,
}

/// Insert a new file or replace the content metadata of an existing one.
pub fn upsert(conn: &Connection, data: &UpsertFileData) -> anyhow::Result<StoredFile> {
    let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    conn.execute(
        "INSERT INTO files (id, name, space, mime_type, size, created_time, modified_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           mime_type = excluded.mime_type,
           size = excluded.size,
           modified_time = excluded.modified_time",
        params![data.id, data.name, data.space, data.mime_type, data.size as i64, now],
    )?;
    find_by_id(conn, data.id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve stored file"))
}

pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changed = conn.execute("DELETE FROM files WHERE id = ?", params![id])?;
    Ok(changed > 0)
}

pub fn total_size(conn: &Connection) -> anyhow::Result<u64> {
    let total: i64 = conn.query_row("SELECT COALESCE(SUM(size), 0) FROM files", [], |row| {
        row.get(0)
    })?;
    Ok(total.max(0) as u64)
}
