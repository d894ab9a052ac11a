//! Two-phase resumable uploads.
//!
//! Phase one (`POST`/`PATCH` with `uploadType=resumable`) records metadata
//! and answers with the session URL in `Location`. Phase two `PUT`s bytes to
//! that URL; `308` reports how much has arrived until the last byte does.

use crate::error::AppError;
use crate::models::file::{self, UpsertFileData};
use crate::state::{AppState, UploadSession};
use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{patch, post, put};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

const DEFAULT_SPACE: &str = "appDataFolder";
const DEFAULT_MIME: &str = "application/octet-stream";

pub fn session_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/upload/drive/v3/files", post(create_session))
        .route("/upload/drive/v3/files/{id}", patch(update_session))
}

pub fn transfer_router() -> Router<Arc<AppState>> {
    Router::new().route("/upload/sessions/{session_id}", put(put_bytes))
}

#[derive(Deserialize)]
struct UploadQuery {
    #[serde(rename = "uploadType")]
    upload_type: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FileMetadata {
    name: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    mime_type: Option<String>,
}

struct SessionPlan {
    file_id: Option<String>,
    name: String,
    space: String,
    mime_type: String,
    total_bytes: u64,
    /// Bytes freed when the upload replaces an existing file
    replaced_bytes: u64,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    Json(meta): Json<FileMetadata>,
) -> Result<Response, AppError> {
    require_resumable(&query)?;
    let name = meta
        .name
        .ok_or_else(|| AppError::BadRequest("File name is required".into()))?;

    let plan = SessionPlan {
        file_id: None,
        name,
        space: meta.parents.into_iter().next().unwrap_or_else(|| DEFAULT_SPACE.into()),
        mime_type: upload_mime(&headers, meta.mime_type),
        total_bytes: upload_length(&headers)?,
        replaced_bytes: 0,
    };
    open_session(&state, &headers, plan).await
}

async fn update_session(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    Json(meta): Json<FileMetadata>,
) -> Result<Response, AppError> {
    require_resumable(&query)?;

    let db = state.db.clone();
    let fid = id.clone();
    let existing = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        file::find_by_id(&conn, &fid)
    })
    .await??
    .ok_or_else(|| AppError::NotFound(format!("File not found: {id}")))?;

    let plan = SessionPlan {
        file_id: Some(id),
        name: meta.name.unwrap_or_else(|| existing.name.clone()),
        space: existing
            .parents
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_SPACE.into()),
        mime_type: upload_mime(&headers, meta.mime_type),
        total_bytes: upload_length(&headers)?,
        replaced_bytes: existing.size_bytes(),
    };
    open_session(&state, &headers, plan).await
}

fn require_resumable(query: &UploadQuery) -> Result<(), AppError> {
    match query.upload_type.as_deref() {
        Some("resumable") => Ok(()),
        other => Err(AppError::BadRequest(format!(
            "Unsupported uploadType: {}",
            other.unwrap_or("none")
        ))),
    }
}

fn upload_length(headers: &HeaderMap) -> Result<u64, AppError> {
    headers
        .get("x-upload-content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| AppError::BadRequest("Missing or invalid X-Upload-Content-Length".into()))
}

fn upload_mime(headers: &HeaderMap, from_metadata: Option<String>) -> String {
    headers
        .get("x-upload-content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(from_metadata)
        .unwrap_or_else(|| DEFAULT_MIME.into())
}

async fn open_session(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    plan: SessionPlan,
) -> Result<Response, AppError> {
    if let Some(limit) = state.config.quota_bytes {
        let db = state.db.clone();
        let used = tokio::task::spawn_blocking(move || {
            let conn = db.get()?;
            file::total_size(&conn)
        })
        .await??;

        if used.saturating_sub(plan.replaced_bytes) + plan.total_bytes > limit {
            tracing::warn!(used, limit, requested = plan.total_bytes, "Quota exceeded");
            return Err(AppError::QuotaExceeded);
        }
    }

    tokio::fs::create_dir_all(&state.config.uploads_dir).await?;
    let session_id = Uuid::new_v4().simple().to_string();
    let part_path = state.config.uploads_dir.join(format!("{session_id}.part"));
    tokio::fs::File::create(&part_path).await?;

    tracing::info!(
        session = %session_id,
        name = %plan.name,
        update = plan.file_id.is_some(),
        total = plan.total_bytes,
        "Upload session opened"
    );

    state.sessions.insert(
        session_id.clone(),
        UploadSession {
            file_id: plan.file_id,
            name: plan.name,
            space: plan.space,
            mime_type: plan.mime_type,
            total_bytes: plan.total_bytes,
            received_bytes: 0,
            part_path,
            touched_at: Instant::now(),
        },
    );

    let url = format!("{}/upload/sessions/{}", public_base(state, headers), session_id);
    Ok((StatusCode::OK, [(header::LOCATION, url)]).into_response())
}

fn public_base(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(url) = &state.config.public_url {
        return url.trim_end_matches('/').to_string();
    }
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("localhost:{}", state.config.port));
    format!("http://{host}")
}

#[derive(Debug, PartialEq, Eq)]
enum ContentRange {
    /// `bytes */<total>`: how much do you have?
    Status,
    /// `bytes <start>-<end>/<total>`
    Chunk { start: u64 },
}

fn parse_content_range(headers: &HeaderMap) -> Result<Option<ContentRange>, AppError> {
    let Some(value) = headers.get(header::CONTENT_RANGE) else {
        return Ok(None);
    };
    let invalid = || AppError::BadRequest("Invalid Content-Range".into());
    let range = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().strip_prefix("bytes "))
        .ok_or_else(invalid)?;

    if range.starts_with("*/") {
        return Ok(Some(ContentRange::Status));
    }
    let start = range
        .split('-')
        .next()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(invalid)?;
    Ok(Some(ContentRange::Chunk { start }))
}

fn resume_incomplete(received: u64) -> Response {
    let mut response = StatusCode::PERMANENT_REDIRECT.into_response();
    if received > 0 {
        if let Ok(v) = HeaderValue::from_str(&format!("bytes=0-{}", received - 1)) {
            response.headers_mut().insert(header::RANGE, v);
        }
    }
    response
}

async fn put_bytes(
    State(state): State<Arc<AppState>>,
    AxumPath(session_id): AxumPath<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let mut session = state
        .sessions
        .get(&session_id)
        .map(|s| s.clone())
        .ok_or_else(|| AppError::NotFound("Upload session not found".into()))?;

    let start = match parse_content_range(&headers)? {
        Some(ContentRange::Status) => return Ok(resume_incomplete(session.received_bytes)),
        Some(ContentRange::Chunk { start }) => start,
        None => 0,
    };
    if start > session.received_bytes {
        return Err(AppError::BadRequest(format!(
            "Chunk starts at {start} but only {} bytes were received",
            session.received_bytes
        )));
    }

    let mut part = tokio::fs::OpenOptions::new()
        .write(true)
        .open(&session.part_path)
        .await?;
    part.set_len(start).await?;
    part.seek(std::io::SeekFrom::Start(start)).await?;

    let mut received = start;
    let mut stream = body.into_data_stream();
    let mut interrupted = None;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) if received + bytes.len() as u64 > session.total_bytes => {
                // keep what arrived before this request, drop the rest
                part.set_len(start).await?;
                session.received_bytes = start;
                session.touched_at = Instant::now();
                state.sessions.insert(session_id, session.clone());
                return Err(AppError::BadRequest(format!(
                    "Body exceeds the declared upload length of {} bytes",
                    session.total_bytes
                )));
            }
            Ok(bytes) => {
                part.write_all(&bytes).await?;
                received += bytes.len() as u64;
            }
            Err(e) => {
                interrupted = Some(e);
                break;
            }
        }
    }
    part.flush().await?;
    drop(part);

    session.received_bytes = received;
    session.touched_at = Instant::now();
    if let Some(e) = interrupted {
        tracing::warn!(session = %session_id, received, "Upload interrupted: {}", e);
        state.sessions.insert(session_id, session);
        return Err(AppError::BadRequest("Upload interrupted".into()));
    }

    if received < session.total_bytes {
        tracing::debug!(session = %session_id, received, total = session.total_bytes, "Chunk stored");
        let response = resume_incomplete(received);
        state.sessions.insert(session_id, session);
        return Ok(response);
    }

    let stored = finalize(&state, session).await?;
    state.sessions.remove(&session_id);
    tracing::info!(file_id = %stored.id, size = %stored.size, "Upload complete");
    Ok((StatusCode::OK, Json(stored)).into_response())
}

async fn finalize(state: &Arc<AppState>, session: UploadSession) -> Result<file::StoredFile, AppError> {
    let file_id = session
        .file_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    tokio::fs::create_dir_all(&state.config.blobs_dir).await?;
    tokio::fs::rename(&session.part_path, state.blob_path(&file_id)).await?;

    let db = state.db.clone();
    let stored = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        file::upsert(
            &conn,
            &UpsertFileData {
                id: &file_id,
                name: &session.name,
                space: &session.space,
                mime_type: &session.mime_type,
                size: session.received_bytes,
            },
        )
    })
    .await??;

    Ok(stored)
}
