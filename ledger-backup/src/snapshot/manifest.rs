//! Manifest written next to the captured files.
//!
//! Diagnostic only: restore never reads it to decide what to copy.

use serde::{Deserialize, Serialize};

pub const BACKUP_VERSION: u32 = 1;

/// Serialized as `data/manifest.json` in each archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub backup_version: u32,
    pub created_at: String,
    pub owner_id: String,
    /// File names actually copied into the archive
    pub db_files: Vec<String>,
}

impl Manifest {
    pub fn new(owner_id: &str) -> Self {
        Self {
            backup_version: BACKUP_VERSION,
            created_at: chrono::Utc::now().to_rfc3339(),
            owner_id: owner_id.to_string(),
            db_files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_wire_names() {
        let mut manifest = Manifest::new("owner-1");
        manifest.db_files.push("ledgerDB.db".to_string());

        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["backupVersion"], 1);
        assert_eq!(value["ownerId"], "owner-1");
        assert_eq!(value["dbFiles"][0], "ledgerDB.db");
        assert!(value["createdAt"].as_str().unwrap().contains('T'));
    }
}
