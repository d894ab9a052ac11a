use crate::error::AppError;
use crate::models::file;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/drive/v3/about", get(about))
}

async fn about(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let db = state.db.clone();
    let usage = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        file::total_size(&conn)
    })
    .await??;

    let mut quota = json!({ "usage": usage.to_string() });
    if let Some(limit) = state.config.quota_bytes {
        quota["limit"] = json!(limit.to_string());
    }
    Ok(Json(json!({ "storageQuota": quota })))
}
