use crate::error::AppError;
use crate::models::file;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::io::ReaderStream;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drive/v3/files", get(list_files))
        .route("/drive/v3/files/{id}", get(get_file).delete(delete_file))
}

#[derive(Deserialize)]
struct ListQuery {
    spaces: Option<String>,
    q: Option<String>,
}

#[derive(Deserialize)]
struct GetQuery {
    alt: Option<String>,
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let name = query.q.as_deref().map(parse_name_query).transpose()?;

    let db = state.db.clone();
    let space = query.spaces.clone();
    let files = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        file::find_all(&conn, space.as_deref(), name.as_deref())
    })
    .await??;

    tracing::debug!(count = files.len(), q = ?query.q, "Listed files");
    Ok(Json(json!({ "files": files })))
}

/// Only exact-name queries are understood: `name = '<value>'`.
fn parse_name_query(q: &str) -> Result<String, AppError> {
    let unsupported = || AppError::BadRequest(format!("Unsupported query: {q}"));
    let value = q
        .trim()
        .strip_prefix("name")
        .map(str::trim_start)
        .and_then(|r| r.strip_prefix('='))
        .map(str::trim)
        .ok_or_else(unsupported)?;
    let inner = value
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .ok_or_else(unsupported)?;
    Ok(inner.replace("\\'", "'"))
}

async fn get_file(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<GetQuery>,
) -> Result<Response, AppError> {
    let db = state.db.clone();
    let fid = id.clone();
    let stored = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        file::find_by_id(&conn, &fid)
    })
    .await??
    .ok_or_else(|| AppError::NotFound(format!("File not found: {id}")))?;

    if query.alt.as_deref() != Some("media") {
        return Ok(Json(stored).into_response());
    }

    let blob = tokio::fs::File::open(state.blob_path(&id)).await?;
    let body = Body::from_stream(ReaderStream::new(blob));
    Ok((
        [
            (header::CONTENT_TYPE, stored.mime_type.clone()),
            (header::CONTENT_LENGTH, stored.size.clone()),
        ],
        body,
    )
        .into_response())
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, AppError> {
    let db = state.db.clone();
    let fid = id.clone();
    let deleted = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        file::delete(&conn, &fid)
    })
    .await??;

    if !deleted {
        return Err(AppError::NotFound(format!("File not found: {id}")));
    }

    if let Err(e) = tokio::fs::remove_file(state.blob_path(&id)).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(file_id = %id, "Failed to remove blob: {}", e);
        }
    }

    tracing::info!(file_id = %id, "File deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_query() {
        assert_eq!(parse_name_query("name = 'backup_u.zip'").unwrap(), "backup_u.zip");
        assert_eq!(parse_name_query("name='it\\'s.zip'").unwrap(), "it's.zip");
        assert!(parse_name_query("mimeType = 'application/zip'").is_err());
        assert!(parse_name_query("name = backup").is_err());
    }
}
