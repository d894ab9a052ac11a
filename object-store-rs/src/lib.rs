//! Local emulator of the app-private remote object space.
//!
//! Speaks the subset of the Drive v3 file API the backup client uses:
//! listing, resumable uploads, media download, delete and quota.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod state;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::state::AppState;
use axum::Router;
use std::sync::Arc;

/// Create the data directories, open and migrate the metadata database.
pub fn build_state(config: AppConfig) -> anyhow::Result<Arc<AppState>> {
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.blobs_dir)?;
    // sessions live in memory, so any partial file left on disk is orphaned
    if config.uploads_dir.exists() {
        std::fs::remove_dir_all(&config.uploads_dir)?;
    }
    std::fs::create_dir_all(&config.uploads_dir)?;

    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool)?;

    Ok(Arc::new(AppState::new(pool, config)))
}

pub fn build_app(config: AppConfig) -> anyhow::Result<Router> {
    Ok(routes::create_router(build_state(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &TempDir, quota: Option<u64>) -> Router {
        let mut config = AppConfig::for_dir(dir.path());
        config.access_token = Some("tok".into());
        config.quota_bytes = quota;
        build_app(config).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn open_session(len: usize) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/upload/drive/v3/files?uploadType=resumable")
            .header(header::HOST, "store.test")
            .header(header::AUTHORIZATION, "Bearer tok")
            .header(header::CONTENT_TYPE, "application/json")
            .header("X-Upload-Content-Length", len.to_string())
            .header("X-Upload-Content-Type", "application/zip")
            .body(Body::from(r#"{"name":"backup_u.zip","parents":["appDataFolder"]}"#))
            .unwrap()
    }

    #[tokio::test]
    async fn test_requests_without_token_are_rejected() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir, None)
            .oneshot(Request::get("/drive/v3/files").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], 401);
    }

    #[tokio::test]
    async fn test_upload_in_two_chunks_then_download() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir, None);

        let response = app.clone().oneshot(open_session(6)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let location = response.headers()[header::LOCATION].to_str().unwrap().to_string();
        assert!(location.starts_with("http://store.test/upload/sessions/"));
        let session_path = location.trim_start_matches("http://store.test").to_string();

        let response = app
            .clone()
            .oneshot(
                Request::put(&session_path)
                    .header(header::CONTENT_RANGE, "bytes 0-3/6")
                    .body(Body::from("abcd"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(response.headers()[header::RANGE], "bytes=0-3");

        let response = app
            .clone()
            .oneshot(
                Request::put(&session_path)
                    .header(header::CONTENT_RANGE, "bytes 4-5/6")
                    .body(Body::from("ef"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stored = json_body(response).await;
        assert_eq!(stored["size"], "6");
        let id = stored["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/drive/v3/files/{id}?alt=media"))
                    .header(header::AUTHORIZATION, "Bearer tok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"abcdef");

        let response = app
            .oneshot(
                Request::get("/drive/v3/files?spaces=appDataFolder&q=name%20%3D%20%27backup_u.zip%27")
                    .header(header::AUTHORIZATION, "Bearer tok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed = json_body(response).await;
        assert_eq!(listed["files"].as_array().unwrap().len(), 1);
        assert_eq!(listed["files"][0]["id"], id.as_str());
    }

    #[tokio::test]
    async fn test_session_open_over_quota_is_forbidden() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir, Some(4)).oneshot(open_session(5)).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = json_body(response).await;
        assert_eq!(body["error"]["errors"][0]["reason"], "storageQuotaExceeded");
    }

    #[tokio::test]
    async fn test_update_of_unknown_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let response = app(&dir, None)
            .oneshot(
                Request::patch("/upload/drive/v3/files/nope?uploadType=resumable")
                    .header(header::AUTHORIZATION, "Bearer tok")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header("X-Upload-Content-Length", "3")
                    .body(Body::from(r#"{"name":"backup_u.zip"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn session_path(response: &axum::response::Response) -> String {
        response.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .trim_start_matches("http://store.test")
            .to_string()
    }

    #[tokio::test]
    async fn test_body_longer_than_declared_is_rejected() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir, None);

        let response = app.clone().oneshot(open_session(4)).await.unwrap();
        let session = session_path(&response);

        let response = app
            .clone()
            .oneshot(Request::put(&session).body(Body::from("abcdefgh")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // nothing was kept and the session still accepts the right bytes
        let response = app
            .clone()
            .oneshot(
                Request::put(&session)
                    .header(header::CONTENT_RANGE, "bytes */4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert!(response.headers().get(header::RANGE).is_none());

        let response = app
            .oneshot(Request::put(&session).body(Body::from("abcd")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["size"], "4");
    }

    #[tokio::test]
    async fn test_idle_sessions_are_reaped_with_their_bytes() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::for_dir(dir.path());
        config.access_token = Some("tok".into());
        let state = build_state(config).unwrap();
        let app = routes::create_router(Arc::clone(&state));

        let response = app.clone().oneshot(open_session(6)).await.unwrap();
        let session = session_path(&response);
        let response = app
            .clone()
            .oneshot(
                Request::put(&session)
                    .header(header::CONTENT_RANGE, "bytes 0-2/6")
                    .body(Body::from("abc"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);

        assert_eq!(state.reap_sessions(std::time::Duration::from_secs(3600)).await, 0);
        assert_eq!(state.reap_sessions(std::time::Duration::ZERO).await, 1);
        assert!(state.sessions.is_empty());
        assert_eq!(std::fs::read_dir(&state.config.uploads_dir).unwrap().count(), 0);

        let response = app
            .oneshot(Request::put(&session).body(Body::from("def")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_startup_discards_orphaned_partial_uploads() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::for_dir(dir.path());
        std::fs::create_dir_all(&config.uploads_dir).unwrap();
        std::fs::write(config.uploads_dir.join("stale.part"), b"xx").unwrap();

        let state = build_state(config).unwrap();
        assert!(state.config.uploads_dir.is_dir());
        assert_eq!(std::fs::read_dir(&state.config.uploads_dir).unwrap().count(), 0);
    }
}
