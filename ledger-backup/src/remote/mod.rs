//! HTTP client for the remote app-private object store.
//!
//! Speaks the Drive v3 file API scoped to one app-private space: list,
//! two-phase resumable upload, media download, delete and quota lookup.
//! Every request carries the caller-supplied bearer token.

pub mod types;

use crate::config::StoreConfig;
use crate::transfer::progress_stream::{ProgressCallback, ProgressStream};
use crate::utils::errors::StoreError;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Body, Client, Method, Response, StatusCode};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
pub use types::{Quota, RemoteFile, SessionStatus, UploadRequest, UploadSession};
use types::{About, FileList};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub const ARCHIVE_MIME: &str = "application/zip";
const LIST_FIELDS: &str = "files(id,name,modifiedTime,size)";
const FILE_FIELDS: &str = "id,name,modifiedTime,size";

/// Client for the app-private file space.
#[derive(Clone)]
pub struct DriveClient {
    client: Client,
    api_base_url: String,
    upload_base_url: String,
    space: String,
    resume_attempts: u32,
    access_token: Arc<RwLock<Option<String>>>,
}

impl DriveClient {
    pub fn new(config: &StoreConfig) -> StoreResult<Self> {
        // 308 is the "resume incomplete" answer of an upload session, never a redirect
        let mut builder = Client::builder().redirect(reqwest::redirect::Policy::none());
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            upload_base_url: config.upload_base_url.trim_end_matches('/').to_string(),
            space: config.space.clone(),
            resume_attempts: config.resume_attempts,
            access_token: Arc::new(RwLock::new(config.access_token.clone())),
        })
    }

    /// Replace the bearer token (after sign-in or a token refresh upstream).
    pub async fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().await = token.filter(|t| !t.is_empty());
    }

    pub async fn has_access_token(&self) -> bool {
        self.access_token.read().await.is_some()
    }

    async fn token(&self) -> StoreResult<String> {
        self.access_token
            .read()
            .await
            .clone()
            .ok_or(StoreError::AuthRequired)
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base_url)
    }

    /// List archives in the app-private space, optionally by exact name.
    pub async fn list_files(&self, name_filter: Option<&str>) -> StoreResult<Vec<RemoteFile>> {
        let token = self.token().await?;
        let mut query = vec![
            ("spaces", self.space.clone()),
            ("fields", LIST_FIELDS.to_string()),
        ];
        if let Some(name) = name_filter {
            query.push(("q", format!("name = '{}'", name.replace('\'', "\\'"))));
        }

        let resp = self
            .client
            .get(self.files_url())
            .query(&query)
            .bearer_auth(&token)
            .send()
            .await?;
        let resp = check_status(resp, "list").await?;
        let list: FileList = resp.json().await?;

        debug!(count = list.files.len(), filter = ?name_filter, "Listed remote files");
        Ok(list.files)
    }

    /// Upload `request.file_path` through a resumable session.
    ///
    /// With `existing_file_id` the session updates that file in place (PATCH);
    /// otherwise it creates a new file in the app-private space (POST).
    /// Interrupted byte transfers are resumed on the same session up to the
    /// configured number of attempts.
    pub async fn upload_file(
        &self,
        request: &UploadRequest,
        progress: Option<ProgressCallback>,
    ) -> StoreResult<RemoteFile> {
        let total = tokio::fs::metadata(&request.file_path).await?.len();
        let session = self.open_session(request, total).await?;

        let mut attempts = 0u32;
        let mut status = self
            .send_bytes(&session, &request.file_path, 0, progress.clone())
            .await;

        loop {
            match status {
                Ok(SessionStatus::Complete(file)) => {
                    if let Some(callback) = &progress {
                        callback(total);
                    }
                    info!(file_id = %file.id, bytes = total, "Upload complete");
                    return Ok(file);
                }
                Ok(SessionStatus::Incomplete { .. }) | Err(StoreError::Http(_))
                    if attempts < self.resume_attempts =>
                {
                    attempts += 1;
                    warn!(attempt = attempts, "Upload interrupted, resuming on the same session");
                    status = self
                        .resume_upload(&session, &request.file_path, progress.clone())
                        .await;
                }
                Ok(SessionStatus::Incomplete { next_offset }) => {
                    return Err(StoreError::InvalidResponse(format!(
                        "upload stopped at byte {next_offset} of {total}"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Phase one: submit metadata and obtain the session URL.
    pub async fn open_session(
        &self,
        request: &UploadRequest,
        total_bytes: u64,
    ) -> StoreResult<UploadSession> {
        let token = self.token().await?;
        let base = format!("{}/upload/drive/v3/files", self.upload_base_url);

        let (method, url, metadata) = match &request.existing_file_id {
            Some(id) => (
                Method::PATCH,
                format!("{base}/{id}"),
                serde_json::json!({ "name": request.file_name }),
            ),
            None => (
                Method::POST,
                base,
                serde_json::json!({ "name": request.file_name, "parents": [self.space] }),
            ),
        };

        debug!(%method, name = %request.file_name, total_bytes, "Opening upload session");
        let resp = self
            .client
            .request(method, url)
            .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
            .bearer_auth(&token)
            .header("X-Upload-Content-Length", total_bytes.to_string())
            .header("X-Upload-Content-Type", ARCHIVE_MIME)
            .json(&metadata)
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            if let Some(id) = &request.existing_file_id {
                return Err(StoreError::NotFound(id.clone()));
            }
        }
        let resp = check_status(resp, "open upload session").await?;

        let url = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(StoreError::MissingSessionUrl)?;

        Ok(UploadSession { url, total_bytes })
    }

    /// Phase two: stream bytes `[offset, total)` of `path` to the session.
    pub async fn send_bytes(
        &self,
        session: &UploadSession,
        path: &Path,
        offset: u64,
        progress: Option<ProgressCallback>,
    ) -> StoreResult<SessionStatus> {
        let mut file = tokio::fs::File::open(path).await?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset)).await?;
        }
        let remaining = session.total_bytes.saturating_sub(offset);
        let stream = ReaderStream::new(file.take(remaining));

        let body = match progress {
            Some(callback) => Body::wrap_stream(ProgressStream::starting_at(stream, offset, callback)),
            None => Body::wrap_stream(stream),
        };

        let mut builder = self
            .client
            .put(&session.url)
            .header(CONTENT_TYPE, ARCHIVE_MIME)
            .header(CONTENT_LENGTH, remaining);
        if offset > 0 && session.total_bytes > 0 {
            builder = builder.header(
                CONTENT_RANGE,
                format!("bytes {}-{}/{}", offset, session.total_bytes - 1, session.total_bytes),
            );
        }

        let resp = builder.body(body).send().await?;
        session_status(resp).await
    }

    /// Ask the session how many bytes it holds.
    pub async fn query_session(&self, session: &UploadSession) -> StoreResult<SessionStatus> {
        let resp = self
            .client
            .put(&session.url)
            .header(CONTENT_LENGTH, 0)
            .header(CONTENT_RANGE, format!("bytes */{}", session.total_bytes))
            .send()
            .await?;
        session_status(resp).await
    }

    /// Re-send whatever the session is still missing, without reopening it.
    pub async fn resume_upload(
        &self,
        session: &UploadSession,
        path: &Path,
        progress: Option<ProgressCallback>,
    ) -> StoreResult<SessionStatus> {
        match self.query_session(session).await? {
            SessionStatus::Incomplete { next_offset } => {
                info!(next_offset, total = session.total_bytes, "Resuming upload");
                self.send_bytes(session, path, next_offset, progress).await
            }
            complete => Ok(complete),
        }
    }

    /// Stream a remote file to `dest_path`; anything but 200 is an error.
    ///
    /// A partially written destination is removed on failure.
    pub async fn download_file(&self, file_id: &str, dest_path: &Path) -> StoreResult<u64> {
        let token = self.token().await?;
        let resp = self
            .client
            .get(format!("{}/{}", self.files_url(), file_id))
            .query(&[("alt", "media")])
            .bearer_auth(&token)
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(file_id.to_string()));
        }
        if resp.status() != StatusCode::OK {
            return Err(status_error(resp, "download").await);
        }

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match write_body(resp, dest_path).await {
            Ok(bytes) => {
                info!(file_id, bytes, "Download complete");
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(dest_path).await;
                Err(e)
            }
        }
    }

    pub async fn delete_file(&self, file_id: &str) -> StoreResult<()> {
        let token = self.token().await?;
        let resp = self
            .client
            .delete(format!("{}/{}", self.files_url(), file_id))
            .bearer_auth(&token)
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(file_id.to_string()));
        }
        check_status(resp, "delete").await?;
        info!(file_id, "Remote file deleted");
        Ok(())
    }

    /// Storage usage for display; not consulted by backup or restore.
    pub async fn get_quota(&self) -> StoreResult<Quota> {
        let token = self.token().await?;
        let resp = self
            .client
            .get(format!("{}/drive/v3/about", self.api_base_url))
            .query(&[("fields", "storageQuota")])
            .bearer_auth(&token)
            .send()
            .await?;
        let about: About = check_status(resp, "quota").await?.json().await?;

        Ok(Quota {
            usage: about.storage_quota.usage.unwrap_or(0),
            limit: about.storage_quota.limit,
        })
    }
}

async fn write_body(resp: Response, dest_path: &Path) -> StoreResult<u64> {
    let mut out = tokio::fs::File::create(dest_path).await?;
    let mut stream = resp.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok(written)
}

async fn session_status(resp: Response) -> StoreResult<SessionStatus> {
    match resp.status() {
        StatusCode::OK | StatusCode::CREATED => Ok(SessionStatus::Complete(resp.json().await?)),
        StatusCode::PERMANENT_REDIRECT => {
            // "Range: bytes=0-<last>" once the server holds anything
            let next_offset = resp
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit('-').next())
                .and_then(|last| last.trim().parse::<u64>().ok())
                .map(|last| last + 1)
                .unwrap_or(0);
            Ok(SessionStatus::Incomplete { next_offset })
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            Err(StoreError::NotFound("upload session".to_string()))
        }
        _ => Err(status_error(resp, "upload bytes").await),
    }
}

async fn check_status(resp: Response, operation: &'static str) -> StoreResult<Response> {
    if resp.status().is_success() {
        Ok(resp)
    } else {
        Err(status_error(resp, operation).await)
    }
}

async fn status_error(resp: Response, operation: &'static str) -> StoreError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    if status == 403 && body.contains("storageQuotaExceeded") {
        return StoreError::QuotaExceeded(body);
    }
    StoreError::Status {
        operation,
        status,
        body,
    }
}
