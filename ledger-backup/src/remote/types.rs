//! Wire types for the remote object store.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// One archive in the app-private space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub modified_time: Option<String>,
    /// The store encodes sizes as decimal strings
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileList {
    #[serde(default)]
    pub files: Vec<RemoteFile>,
}

/// Storage usage of the signed-in account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub usage: u64,
    /// `None` for unlimited accounts
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct About {
    pub storage_quota: StorageQuota,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StorageQuota {
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub usage: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub limit: Option<u64>,
}

/// Input to [`super::DriveClient::upload_file`].
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_path: PathBuf,
    pub file_name: String,
    /// Update this file in place instead of creating a new one
    pub existing_file_id: Option<String>,
}

/// An opened resumable upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub url: String,
    pub total_bytes: u64,
}

/// Server-side state of an upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// The server holds bytes `[0, next_offset)`.
    Incomplete { next_offset: u64 },
    Complete(RemoteFile),
}

fn de_opt_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }

    match Option::<NumOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumOrString::Num(n)) => Ok(Some(n)),
        Some(NumOrString::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}
